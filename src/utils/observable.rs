//! A registry of event handlers keyed by event name.
//!
//! Subscribers register closures and get back an opaque [`SubscriptionHandle`] they can later pass
//! to [`Observable::unsubscribe`]. Every handler invocation runs on a fresh thread with its own
//! clone of the event, so a slow subscriber never stalls the emitter, and subscribers hold no
//! reference to the emitter.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    thread,
};

pub type ObserverPtr<E> = Arc<dyn Fn(E) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
}

struct Subscribers<E> {
    next_id: u64,
    by_event: HashMap<String, Vec<(SubscriptionHandle, ObserverPtr<E>)>>,
}

/// Implemented by event types so the observable knows which subscribers an event goes to.
pub trait Named {
    fn event_name(&self) -> &'static str;
}

pub struct Observable<E> {
    subscribers: Arc<RwLock<Subscribers<E>>>,
}

impl<E> Clone for Observable<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for Observable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> Observable<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Subscribers {
                next_id: 0,
                by_event: HashMap::new(),
            })),
        }
    }

    pub fn subscribe(
        &self,
        event_name: &str,
        handler: impl Fn(E) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let mut subscribers = self.subscribers.write().expect("observable lock poisoned");
        let handle = SubscriptionHandle {
            id: subscribers.next_id,
        };
        subscribers.next_id += 1;
        subscribers
            .by_event
            .entry(event_name.to_string())
            .or_default()
            .push((handle, Arc::new(handler)));
        handle
    }

    /// Remove the subscription behind `handle`. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write().expect("observable lock poisoned");
        for handlers in subscribers.by_event.values_mut() {
            if let Some(position) = handlers.iter().position(|(h, _)| *h == handle) {
                handlers.remove(position);
                return true;
            }
        }
        false
    }

    /// Invoke every handler subscribed to `event_name`, each on its own thread.
    pub fn emit_named(&self, event_name: &str, event: E) {
        let handlers: Vec<ObserverPtr<E>> = {
            let subscribers = self.subscribers.read().expect("observable lock poisoned");
            match subscribers.by_event.get(event_name) {
                Some(handlers) => handlers.iter().map(|(_, handler)| handler.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            let event = event.clone();
            thread::spawn(move || handler(event));
        }
    }

    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscribers
            .read()
            .expect("observable lock poisoned")
            .by_event
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        self.subscribers
            .write()
            .expect("observable lock poisoned")
            .by_event
            .clear();
    }
}

impl<E: Named + Clone + Send + 'static> Observable<E> {
    pub fn emit(&self, event: E) {
        self.emit_named(event.event_name(), event)
    }
}
