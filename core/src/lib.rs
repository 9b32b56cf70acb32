//! Session authentication and resilient requests for a CouchDB-compatible
//! HTTP API.
//!
//! # Overview
//! Every request goes through a `RequestExecutor`: an ordered
//! `InterceptorChain` decorates each attempt and inspects each response, and
//! a bounded loop replays the request whenever an interceptor asks for it.
//! Two causes of replay are built in:
//!
//! - an expired session (`403 credentials_expired` or `401`), handled by
//!   `CookieAuthInterceptor` and `IamAuthInterceptor`, which renew the
//!   session cookie before the replay;
//! - rate limiting (`429`), handled by `BackoffInterceptor`, which waits
//!   before the replay.
//!
//! # Design
//! - The executor is synchronous; any number of threads may share one client.
//!   Blocking happens only in network I/O and in backoff sleeps.
//! - Session credentials live in a `SessionCache` per auth interceptor. Reads
//!   are lock-free and at most one renewal is in flight per cache.
//! - Request bodies are replayable by construction (`RequestBody`); a
//!   single-shot reader is teed into memory on first send.
//! - `CouchClient` wires it all together from a `ClientConfig`.

pub mod auth;
pub mod backoff;
pub mod body;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod http;
pub mod interceptor;
pub mod interrupt;
pub mod user_agent;

#[cfg(test)]
mod test_support;

pub use auth::{
    BasicAuthInterceptor, CookieAuthInterceptor, IamAuthInterceptor, SessionCache, SessionCredential,
    SessionInterceptor, SessionSource,
};
pub use backoff::{BackoffInterceptor, BackoffPolicy};
pub use body::RequestBody;
pub use client::{CouchClient, CouchClientBuilder};
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionConfig, ProxyConfig, Timeouts, UreqConnection};
pub use error::{AuthError, ErrorResponse, TransportError};
pub use executor::RequestExecutor;
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use interceptor::{Decision, Exchange, Interceptor, InterceptorChain};
pub use interrupt::Interrupt;
pub use user_agent::UserAgentInterceptor;
