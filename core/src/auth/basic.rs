//! HTTP Basic authentication, used for IAM client credentials.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::TransportError;
use crate::interceptor::{Exchange, Interceptor};

/// Adds `Authorization: Basic ...` to requests, optionally only to those
/// addressed to one URL.
#[derive(Clone)]
pub struct BasicAuthInterceptor {
    header: String,
    only_for: Option<String>,
}

impl BasicAuthInterceptor {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            header: format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))),
            only_for: None,
        }
    }

    /// Restricts the header to requests for exactly `url`.
    pub fn scoped_to(mut self, url: impl Into<String>) -> Self {
        self.only_for = Some(url.into());
        self
    }
}

impl fmt::Debug for BasicAuthInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthInterceptor")
            .field("only_for", &self.only_for)
            .finish_non_exhaustive()
    }
}

impl Interceptor for BasicAuthInterceptor {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn intercept_request(&self, exchange: &mut Exchange<'_>) -> Result<(), TransportError> {
        if self.only_for.as_deref().is_some_and(|url| url != exchange.url()) {
            return Ok(());
        }
        exchange.set_header("Authorization", self.header.clone());
        Ok(())
    }
}
