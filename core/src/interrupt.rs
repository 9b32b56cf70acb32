//! Cooperative cancellation for blocking waits.
//!
//! A request carrying an `Interrupt` stops at the next suspension point once
//! `interrupt()` is called: a backoff sleep wakes immediately and fails the
//! request, and no further attempt is started.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::TransportError;

#[derive(Debug, Default)]
struct Flag {
    interrupted: Mutex<bool>,
    wake: Condvar,
}

/// Shared handle used to abort a request from another thread.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<Flag>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        *self.flag.interrupted.lock() = true;
        self.flag.wake.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        *self.flag.interrupted.lock()
    }

    /// Blocks for `duration` unless interrupted first.
    pub fn sleep(&self, duration: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + duration;
        let mut interrupted = self.flag.interrupted.lock();
        while !*interrupted {
            if self.flag.wake.wait_until(&mut interrupted, deadline).timed_out() {
                break;
            }
        }
        if *interrupted {
            Err(TransportError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Sleeps on the calling thread, waking early if `interrupt` fires.
pub(crate) fn sleep(interrupt: Option<&Interrupt>, duration: Duration) -> Result<(), TransportError> {
    match interrupt {
        Some(interrupt) => interrupt.sleep(duration),
        None => {
            std::thread::sleep(duration);
            Ok(())
        }
    }
}
