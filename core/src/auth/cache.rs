//! Shared credential cache with single-flight renewal.
//!
//! # Design
//! The current credential sits behind an `ArcSwapOption`, so a request that
//! finds a usable credential never takes a lock. Renewal is serialised by a
//! mutex guarding an `in_flight` marker: the first caller to find the
//! credential missing, expired or stale performs the network round trip with
//! the mutex released, and every other caller parks on the condvar until that
//! renewal finishes, then reads its result.
//!
//! Each stored credential carries a generation number. A caller that saw a
//! credential rejected passes the generation it used; if the cache already
//! holds a newer one, that is returned and no second renewal happens.

use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::error::AuthError;

/// A freshly acquired value and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct Expiring<T> {
    pub value: T,
    pub expires_at: Option<SystemTime>,
}

impl<T> Expiring<T> {
    pub fn new(value: T, expires_at: Option<SystemTime>) -> Self {
        Self { value, expires_at }
    }
}

/// A credential as stored in the cache. Never mutated once published.
#[derive(Debug)]
pub struct Cached<T> {
    pub value: T,
    pub expires_at: Option<SystemTime>,
    pub generation: u64,
}

impl<T> Cached<T> {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= SystemTime::now())
    }
}

#[derive(Default)]
struct RenewalState {
    in_flight: bool,
    /// Generations handed out so far, by renewals (successful or not) and
    /// by `replace`.
    epoch: u64,
    last_failure: Option<(u64, AuthError)>,
}

pub struct SessionCache<T> {
    current: ArcSwapOption<Cached<T>>,
    renewal: Mutex<RenewalState>,
    renewed: Condvar,
}

impl<T> Default for SessionCache<T> {
    fn default() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            renewal: Mutex::new(RenewalState::default()),
            renewed: Condvar::new(),
        }
    }
}

impl<T> SessionCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored credential, expired or not.
    pub fn current(&self) -> Option<Arc<Cached<T>>> {
        self.current.load_full()
    }

    /// The stored credential if it has not expired.
    pub fn usable(&self) -> Option<Arc<Cached<T>>> {
        self.current().filter(|cached| !cached.is_expired())
    }

    /// Returns a usable credential, renewing it first if there is none.
    pub fn get_or_renew<F>(&self, renew: F) -> Result<Arc<Cached<T>>, AuthError>
    where
        F: FnOnce() -> Result<Expiring<T>, AuthError>,
    {
        match self.usable() {
            Some(cached) => Ok(cached),
            None => self.renew_unless_replaced(None, renew),
        }
    }

    /// Renews the credential unless it has already moved on from `stale`.
    ///
    /// `stale` is the generation the caller saw rejected, or `None` when it had
    /// no credential at all. If a renewal is already running the caller waits
    /// for it and shares its outcome, including its error.
    pub fn renew_unless_replaced<F>(&self, stale: Option<u64>, renew: F) -> Result<Arc<Cached<T>>, AuthError>
    where
        F: FnOnce() -> Result<Expiring<T>, AuthError>,
    {
        let mut state = self.renewal.lock();
        loop {
            if let Some(cached) = self.usable() {
                if Some(cached.generation) != stale {
                    return Ok(cached);
                }
            }
            if !state.in_flight {
                break;
            }

            let awaited = state.epoch + 1;
            debug!(epoch = awaited, "waiting for renewal in flight");
            while state.in_flight {
                self.renewed.wait(&mut state);
            }
            if let Some((epoch, error)) = &state.last_failure {
                if *epoch == awaited {
                    return Err(error.clone());
                }
            }
        }

        state.in_flight = true;
        let generation = state.epoch + 1;
        let outcome = MutexGuard::unlocked(&mut state, renew);
        self.finish(&mut state, generation, outcome)
    }

    fn finish(
        &self,
        state: &mut RenewalState,
        generation: u64,
        outcome: Result<Expiring<T>, AuthError>,
    ) -> Result<Arc<Cached<T>>, AuthError> {
        state.in_flight = false;
        state.epoch = generation;
        let result = match outcome {
            Ok(fresh) => {
                let cached = Arc::new(Cached {
                    value: fresh.value,
                    expires_at: fresh.expires_at,
                    generation,
                });
                self.current.store(Some(Arc::clone(&cached)));
                state.last_failure = None;
                debug!(generation, "credential renewed");
                Ok(cached)
            }
            Err(error) => {
                state.last_failure = Some((generation, error.clone()));
                Err(error)
            }
        };
        self.renewed.notify_all();
        result
    }

    /// Publishes a credential obtained outside a renewal, for instance one the
    /// server refreshed on an ordinary response. Returns `None` without
    /// storing anything while a renewal is in flight.
    pub fn replace(&self, fresh: Expiring<T>) -> Option<Arc<Cached<T>>> {
        let mut state = self.renewal.lock();
        if state.in_flight {
            return None;
        }
        state.epoch += 1;
        let cached = Arc::new(Cached {
            value: fresh.value,
            expires_at: fresh.expires_at,
            generation: state.epoch,
        });
        self.current.store(Some(Arc::clone(&cached)));
        debug!(generation = cached.generation, "credential replaced");
        Some(cached)
    }

    /// Drops the credential if it is still the one with `generation`.
    pub fn invalidate(&self, generation: u64) {
        let _state = self.renewal.lock();
        if self.current().is_some_and(|cached| cached.generation == generation) {
            self.current.store(None);
        }
    }

    pub fn clear(&self) {
        let _state = self.renewal.lock();
        self.current.store(None);
    }
}
