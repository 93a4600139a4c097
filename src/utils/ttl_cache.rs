//! A thread-safe map whose entries expire after a per-entry time to live.
//!
//! Expired entries are invisible to readers immediately. They are physically removed by a reaper
//! thread that is started lazily on the first insert and exits once the cache is drained (or
//! dropped), so an idle cache costs no thread.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, Weak},
    thread,
    time::{Duration, Instant},
};

pub type EvictionCallback<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

struct CacheState<K, V> {
    entries: HashMap<K, (V, Instant)>,
    reaper_running: bool,
}

#[derive(Clone)]
pub struct TtlCache<K, V> {
    state: Arc<Mutex<CacheState<K, V>>>,
    default_ttl: Duration,
    reap_interval: Duration,
    on_evict: Option<EvictionCallback<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                reaper_running: false,
            })),
            default_ttl,
            reap_interval: Duration::from_millis(1000).min(default_ttl.max(Duration::from_millis(10))),
            on_evict: None,
        }
    }

    /// Register a callback invoked (on the reaper thread) for each entry removed by expiry.
    pub fn with_eviction_callback(mut self, on_evict: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Arc::new(on_evict));
        self
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut state = self.lock();
        state.entries.insert(key, (value, Instant::now() + ttl));
        if !state.reaper_running {
            state.reaper_running = true;
            self.start_reaper();
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let state = self.lock();
        match state.entries.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Some(value.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        match state.entries.remove(key) {
            Some((value, expiry)) if expiry > Instant::now() => Some(value),
            _ => None,
        }
    }

    /// Insert `key` unless a live entry for it exists. Returns whether the insert happened.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some((_, expiry)) = state.entries.get(&key) {
            if *expiry > now {
                return false;
            }
        }
        state.entries.insert(key, (value, now + self.default_ttl));
        if !state.reaper_running {
            state.reaper_running = true;
            self.start_reaper();
        }
        true
    }

    /// Number of entries, including expired entries that have not been reaped yet.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().expect("ttl cache mutex poisoned")
    }

    fn start_reaper(&self) {
        let state: Weak<Mutex<CacheState<K, V>>> = Arc::downgrade(&self.state);
        let interval = self.reap_interval;
        let on_evict = self.on_evict.clone();
        thread::spawn(move || loop {
            thread::sleep(interval);
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut evicted = Vec::new();
            let drained = {
                let mut state = state.lock().expect("ttl cache mutex poisoned");
                let now = Instant::now();
                let expired: Vec<K> = state
                    .entries
                    .iter()
                    .filter(|(_, (_, expiry))| *expiry <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in expired {
                    if let Some((value, _)) = state.entries.remove(&key) {
                        evicted.push((key, value));
                    }
                }
                if state.entries.is_empty() {
                    state.reaper_running = false;
                }
                !state.reaper_running
            };
            if let Some(on_evict) = &on_evict {
                evicted.iter().for_each(|(key, value)| on_evict(key, value));
            }
            if drained {
                return;
            }
        });
    }
}
