//! A blocking token bucket over [`governor`]'s direct rate limiter.

use std::{num::NonZeroU32, thread, time::Instant};

use governor::{
    clock::{Clock, DefaultClock},
    DefaultDirectRateLimiter, Quota, RateLimiter,
};

pub struct TokenBucket {
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
}

impl TokenBucket {
    /// A bucket refilled at `per_second` tokens per second holding at most `burst` tokens. Zero
    /// values are clamped to one.
    pub fn new(per_second: u32, burst: u32) -> TokenBucket {
        let per_second = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        TokenBucket {
            limiter: RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst)),
            clock: DefaultClock::default(),
        }
    }

    /// Take a token if one is available now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Block until a token is available or `deadline` passes. Returns whether a token was taken.
    pub fn acquire(&self, deadline: Instant) -> bool {
        loop {
            match self.limiter.check() {
                Ok(()) => return true,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    if Instant::now() + wait > deadline {
                        return false;
                    }
                    thread::sleep(wait);
                }
            }
        }
    }
}
