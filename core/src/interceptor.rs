//! Request-mutation and response-inspection stages.
//!
//! # Design
//! Every interceptor implements both hooks of `Interceptor`; the defaults do
//! nothing, so a stage only overrides the side it cares about. The chain runs
//! them in registration order on both sides. Response hooks return a
//! `Decision` instead of raising errors to ask for a replay; errors are
//! reserved for conditions that must end the request.
//!
//! Each interceptor gets a private state slot in the `Exchange`, which lives
//! for the whole logical request. That is where per-request counters (backoff)
//! and the credential an attempt used (session auth) are kept, so one
//! interceptor instance can serve many concurrent requests.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::TransportError;
use crate::http::{header_value, set_header, HttpMethod, HttpResponse};
use crate::interrupt::{self, Interrupt};

/// Outcome of a response hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Replay,
}

pub trait Interceptor: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &'static str;

    fn intercept_request(&self, _exchange: &mut Exchange<'_>) -> Result<(), TransportError> {
        Ok(())
    }

    fn intercept_response(
        &self,
        _exchange: &mut Exchange<'_>,
        _response: &mut HttpResponse,
    ) -> Result<Decision, TransportError> {
        Ok(Decision::Continue)
    }
}

/// State of one logical request as seen by the interceptors.
pub struct Exchange<'a> {
    id: Uuid,
    method: HttpMethod,
    url: &'a str,
    headers: Vec<(String, String)>,
    attempt: u32,
    retries_remaining: u32,
    interrupt: Option<&'a Interrupt>,
    slot: usize,
    slots: Vec<Option<Box<dyn Any + Send>>>,
}

impl<'a> Exchange<'a> {
    pub(crate) fn new(
        method: HttpMethod,
        url: &'a str,
        interceptors: usize,
        interrupt: Option<&'a Interrupt>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            url,
            headers: Vec::new(),
            attempt: 0,
            retries_remaining: 0,
            interrupt,
            slot: 0,
            slots: (0..interceptors).map(|_| None).collect(),
        }
    }

    pub(crate) fn begin_attempt(&mut self, attempt: u32, retries_remaining: u32, headers: Vec<(String, String)>) {
        self.attempt = attempt;
        self.retries_remaining = retries_remaining;
        self.headers = headers;
    }

    /// Correlation id shared by every attempt of this request.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &str {
        self.url
    }

    /// 1-based number of the attempt in flight.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempts still allowed after the current one.
    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.headers, name, value);
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn interrupt(&self) -> Option<&Interrupt> {
        self.interrupt
    }

    /// Blocks the calling thread, failing early if the request is interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<(), TransportError> {
        interrupt::sleep(self.interrupt, duration)
    }

    /// The calling interceptor's state for this request, created on first use.
    pub fn state_mut<T: Any + Send + Default>(&mut self) -> &mut T {
        let slot = &mut self.slots[self.slot];
        if !matches!(slot, Some(state) if state.is::<T>()) {
            *slot = Some(Box::new(T::default()));
        }
        match slot.as_mut().and_then(|state| state.downcast_mut::<T>()) {
            Some(state) => state,
            None => unreachable!("interceptor slot holds the requested type"),
        }
    }
}

/// Ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub(crate) fn run_request(&self, exchange: &mut Exchange<'_>) -> Result<(), TransportError> {
        for (slot, interceptor) in self.interceptors.iter().enumerate() {
            exchange.slot = slot;
            interceptor.intercept_request(exchange)?;
        }
        Ok(())
    }

    /// Runs every response hook; the result is `Replay` if any of them asked for one.
    pub(crate) fn run_response(
        &self,
        exchange: &mut Exchange<'_>,
        response: &mut HttpResponse,
    ) -> Result<Decision, TransportError> {
        let mut decision = Decision::Continue;
        for (slot, interceptor) in self.interceptors.iter().enumerate() {
            exchange.slot = slot;
            if interceptor.intercept_response(exchange, response)? == Decision::Replay {
                tracing::debug!(interceptor = interceptor.name(), "replay requested");
                decision = Decision::Replay;
            }
        }
        Ok(decision)
    }
}

impl Extend<Arc<dyn Interceptor>> for InterceptorChain {
    fn extend<I: IntoIterator<Item = Arc<dyn Interceptor>>>(&mut self, iter: I) {
        self.interceptors.extend(iter);
    }
}
