//! A counting semaphore that never blocks, used to gate admission of new connections.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

pub struct TrySemaphore {
    available: AtomicUsize,
}

impl TrySemaphore {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            available: AtomicUsize::new(permits),
        })
    }

    /// Take a permit if one is free. The permit is returned when the result is dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|_| Permit {
                semaphore: self.clone(),
            })
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }
}

pub struct Permit {
    semaphore: Arc<TrySemaphore>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.semaphore.available.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_bounded_and_returned() {
        let semaphore = TrySemaphore::new(2);
        let a = semaphore.try_acquire().unwrap();
        let _b = semaphore.try_acquire().unwrap();
        assert!(semaphore.try_acquire().is_none());
        drop(a);
        assert_eq!(semaphore.available(), 1);
        assert!(semaphore.try_acquire().is_some());
    }
}
