//! Rate-limit replay.
//!
//! A `429 Too Many Requests` response is replayed after a delay: the server's
//! integer-seconds `Retry-After` when present and honoured, otherwise
//! `base_interval * multiplier^n` where `n` counts the 429s this request has
//! already been replayed for. Both kinds of delay are capped at one hour. The
//! wait blocks the calling thread.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::http::HttpResponse;
use crate::interceptor::{Decision, Exchange, Interceptor};

/// Longest delay before a replay, whether computed or requested through
/// `Retry-After`.
pub const MAX_DELAY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_interval_millis: u64,
    pub multiplier: u32,
    pub honor_retry_after: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_interval_millis: 250,
            multiplier: 2,
            honor_retry_after: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_interval: Duration) -> Self {
        Self {
            max_attempts,
            base_interval_millis: base_interval.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Policy guarding the IAM token endpoint.
    pub fn token_endpoint() -> Self {
        Self {
            max_attempts: 3,
            ..Self::default()
        }
    }

    pub fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    /// Exponential delay before replay number `replay` (0-based), at most `MAX_DELAY`.
    pub fn interval(&self, replay: u32) -> Duration {
        let factor = u64::from(self.multiplier).saturating_pow(replay);
        Duration::from_millis(self.base_interval_millis.saturating_mul(factor)).min(MAX_DELAY)
    }

    /// Delay before replay number `replay`, preferring a usable `Retry-After`.
    pub fn delay(&self, replay: u32, retry_after: Option<&str>) -> Duration {
        let fallback = self.interval(replay);
        let Some(value) = retry_after.filter(|_| self.honor_retry_after) else {
            return fallback;
        };
        match value.trim().parse::<u64>() {
            Ok(seconds) => {
                let requested = Duration::from_secs(seconds);
                if requested > MAX_DELAY {
                    warn!(seconds, "Retry-After exceeds one hour, capping");
                    MAX_DELAY
                } else {
                    requested
                }
            }
            Err(_) => {
                warn!(value, "invalid Retry-After value, using exponential backoff");
                fallback
            }
        }
    }
}

/// Replays 429 responses according to a `BackoffPolicy`.
///
/// Counters live in the request's exchange, so one instance can be shared by
/// any number of concurrent requests and separate instances never interfere.
#[derive(Debug, Clone, Default)]
pub struct BackoffInterceptor {
    policy: BackoffPolicy,
}

#[derive(Default)]
struct Replays(u32);

impl BackoffInterceptor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

impl Interceptor for BackoffInterceptor {
    fn name(&self) -> &'static str {
        "backoff"
    }

    fn intercept_response(
        &self,
        exchange: &mut Exchange<'_>,
        response: &mut HttpResponse,
    ) -> Result<Decision, TransportError> {
        if response.status != 429 {
            return Ok(Decision::Continue);
        }

        let replay = exchange.state_mut::<Replays>().0;
        if replay + 1 >= self.policy.max_attempts || exchange.retries_remaining() == 0 {
            debug!(replay, "no replays left for 429 response");
            return Ok(Decision::Continue);
        }

        let delay = self.policy.delay(replay, response.header("retry-after"));
        let reason = String::from_utf8_lossy(response.buffer()?).into_owned();
        warn!(
            url = exchange.url(),
            delay_ms = delay.as_millis() as u64,
            "{} will retry after backoff",
            reason.trim()
        );

        exchange.state_mut::<Replays>().0 += 1;
        exchange.sleep(delay)?;
        Ok(Decision::Replay)
    }
}
