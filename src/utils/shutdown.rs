//! Helpers for background threads that stop on a shutdown signal.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    time::Duration,
};

/// Sleep for `duration` or until the shutdown signal arrives, whichever comes first. Returns `true`
/// if the thread should stop.
pub fn sleep_or_shutdown(shutdown_signal: &Receiver<()>, duration: Duration) -> bool {
    match shutdown_signal.recv_timeout(duration) {
        Ok(()) => true,
        Err(RecvTimeoutError::Timeout) => false,
        Err(RecvTimeoutError::Disconnected) => {
            panic!("Background thread disconnected from main thread")
        }
    }
}

/// Non-blocking check for the shutdown signal.
pub fn should_shut_down(shutdown_signal: &Receiver<()>) -> bool {
    match shutdown_signal.try_recv() {
        Ok(()) => true,
        Err(TryRecvError::Empty) => false,
        Err(TryRecvError::Disconnected) => {
            panic!("Background thread disconnected from main thread")
        }
    }
}
