//! Non-blocking reader/writer locks keyed by an arbitrary value (in practice, a name).
//!
//! Nothing here ever waits: a caller that cannot take a lock is told so immediately and is expected
//! to give up (the sector server stays silent, the updater reports `NameLocked`).

use std::{collections::HashMap, hash::Hash, sync::Mutex};

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

pub struct MultiLocker<K> {
    locks: Mutex<HashMap<K, LockState>>,
}

impl<K: Eq + Hash + Clone> Default for MultiLocker<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> MultiLocker<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take the write lock on `key` if nobody holds it in any mode.
    pub fn try_lock(&self, key: &K) -> bool {
        let mut locks = self.locks.lock().expect("multi locker mutex poisoned");
        let state = locks.entry(key.clone()).or_default();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    /// Take a read lock on `key` unless it is write-locked.
    pub fn try_rlock(&self, key: &K) -> bool {
        let mut locks = self.locks.lock().expect("multi locker mutex poisoned");
        let state = locks.entry(key.clone()).or_default();
        if state.writer {
            return false;
        }
        state.readers += 1;
        true
    }

    /// Release the write lock on `key`.
    ///
    /// # Panics
    ///
    /// If `key` is not write-locked.
    pub fn unlock(&self, key: &K) {
        let mut locks = self.locks.lock().expect("multi locker mutex poisoned");
        match locks.get_mut(key) {
            Some(state) if state.writer => {
                state.writer = false;
                if state.readers == 0 {
                    locks.remove(key);
                }
            }
            _ => panic!("unlock of a key that is not write-locked"),
        }
    }

    /// Release one read lock on `key`.
    ///
    /// # Panics
    ///
    /// If `key` is not read-locked.
    pub fn runlock(&self, key: &K) {
        let mut locks = self.locks.lock().expect("multi locker mutex poisoned");
        match locks.get_mut(key) {
            Some(state) if state.readers > 0 => {
                state.readers -= 1;
                if state.readers == 0 && !state.writer {
                    locks.remove(key);
                }
            }
            _ => panic!("runlock of a key that is not read-locked"),
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .lock()
            .expect("multi locker mutex poisoned")
            .get(key)
            .map_or(false, |state| state.writer)
    }

    /// Like [`try_lock`](Self::try_lock), but released when the returned guard is dropped.
    pub fn try_write(&self, key: &K) -> Option<WriteGuard<'_, K>> {
        self.try_lock(key).then(|| WriteGuard {
            locker: self,
            key: key.clone(),
        })
    }

    /// Like [`try_rlock`](Self::try_rlock), but released when the returned guard is dropped.
    pub fn try_read(&self, key: &K) -> Option<ReadGuard<'_, K>> {
        self.try_rlock(key).then(|| ReadGuard {
            locker: self,
            key: key.clone(),
        })
    }
}

pub struct WriteGuard<'a, K: Eq + Hash + Clone> {
    locker: &'a MultiLocker<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for WriteGuard<'_, K> {
    fn drop(&mut self) {
        self.locker.unlock(&self.key)
    }
}

pub struct ReadGuard<'a, K: Eq + Hash + Clone> {
    locker: &'a MultiLocker<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for ReadGuard<'_, K> {
    fn drop(&mut self) {
        self.locker.runlock(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writers_exclude_everyone() {
        let locker = MultiLocker::new();
        let key = "foo".to_string();
        assert!(locker.try_lock(&key));
        assert!(!locker.try_lock(&key));
        assert!(!locker.try_rlock(&key));
        assert!(locker.try_lock(&"bar".to_string()));
        locker.unlock(&key);
        assert!(locker.try_rlock(&key));
    }

    #[test]
    fn readers_share_but_exclude_writers() {
        let locker = MultiLocker::new();
        assert!(locker.try_rlock(&1));
        assert!(locker.try_rlock(&1));
        assert!(!locker.try_lock(&1));
        locker.runlock(&1);
        assert!(!locker.try_lock(&1));
        locker.runlock(&1);
        assert!(locker.try_lock(&1));
    }

    #[test]
    fn guards_release_on_drop() {
        let locker = MultiLocker::new();
        {
            let _guard = locker.try_write(&1).unwrap();
            assert!(locker.try_write(&1).is_none());
            assert!(locker.is_locked(&1));
        }
        assert!(!locker.is_locked(&1));
        assert!(locker.try_read(&1).is_some());
    }

    #[test]
    #[should_panic]
    fn unlocking_an_unlocked_key_panics() {
        MultiLocker::<u8>::new().unlock(&1);
    }
}
