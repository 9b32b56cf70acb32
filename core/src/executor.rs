//! The bounded replay loop around a `Connection`.
//!
//! # Design
//! One call to `exchange` is one logical request. Each attempt starts from the
//! request's own headers, lets the request interceptors decorate them, opens a
//! fresh body, sends, and lets the response interceptors vote. A replay is
//! honoured only while the attempt budget lasts; the budget is shared by every
//! cause (expired session, rate limiting, custom interceptors).

use std::sync::Arc;

use tracing::{debug, debug_span, info};

use crate::connection::{Attempt, Connection};
use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponse};
use crate::interceptor::{Decision, Exchange, InterceptorChain};

/// Attempts allowed when the request does not set its own budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Clone)]
pub struct RequestExecutor {
    connection: Arc<dyn Connection>,
    chain: InterceptorChain,
    default_max_attempts: u32,
}

impl RequestExecutor {
    pub fn new(connection: Arc<dyn Connection>, chain: InterceptorChain) -> Self {
        Self {
            connection,
            chain,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts.max(1);
        self
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Runs the request and fails on any non-2xx final response.
    pub fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.clone();
        let response = self.exchange(request)?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(TransportError::from_response(&url, response))
        }
    }

    /// Runs the request and returns the final response whatever its status.
    pub fn exchange(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            max_attempts,
            interrupt,
            timeouts,
        } = request;
        let budget = max_attempts.unwrap_or(self.default_max_attempts).max(1);
        let mut exchange = Exchange::new(method, &url, self.chain.len(), interrupt.as_ref());

        let span = debug_span!("request", id = %exchange.id(), %method, url = %url);
        let _entered = span.enter();

        let mut attempt = 0;
        loop {
            attempt += 1;
            if interrupt.as_ref().is_some_and(|i| i.is_interrupted()) {
                return Err(TransportError::Interrupted);
            }

            exchange.begin_attempt(attempt, budget - attempt, headers.clone());
            self.chain.run_request(&mut exchange)?;

            debug!(attempt, budget, "sending request");
            let mut response = self.connection.send(Attempt {
                method,
                url: &url,
                headers: exchange.headers(),
                body: body.open()?,
                timeouts,
            })?;
            debug!(attempt, status = response.status, "received response");

            let decision = self.chain.run_response(&mut exchange, &mut response)?;
            if decision == Decision::Continue {
                return Ok(response);
            }
            if attempt >= budget {
                info!(attempts = attempt, "maximum number of attempts reached");
                return Ok(response);
            }
            response.discard();
        }
    }
}
