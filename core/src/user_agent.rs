use crate::error::TransportError;
use crate::interceptor::{Exchange, Interceptor};

/// Sets the `User-Agent` header on every attempt.
#[derive(Debug, Clone)]
pub struct UserAgentInterceptor {
    value: String,
}

impl UserAgentInterceptor {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    /// `couch-http/<version>/rust/<os>/<arch>`
    pub fn default_value() -> String {
        format!(
            "{}/{}/rust/{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        )
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Default for UserAgentInterceptor {
    fn default() -> Self {
        Self::new(Self::default_value())
    }
}

impl Interceptor for UserAgentInterceptor {
    fn name(&self) -> &'static str {
        "user-agent"
    }

    fn intercept_request(&self, exchange: &mut Exchange<'_>) -> Result<(), TransportError> {
        exchange.set_header("User-Agent", self.value.clone());
        Ok(())
    }
}
