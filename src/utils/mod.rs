//! Concurrency utilities shared across subsystems.

pub mod multi_locker;

pub mod observable;

pub mod rate_limiter;

pub mod sampler;

pub mod semaphore;

pub mod shutdown;

pub mod ttl_cache;
