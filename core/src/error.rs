//! Error types for the transport layer.
//!
//! # Design
//! Statuses that callers commonly branch on (404, 409, 412, 429) get their own
//! variants; every other non-2xx lands in `Http`. All of them carry an
//! `ErrorResponse` with the status, the URL and the parsed `error`/`reason`
//! fields, falling back to the raw body when the server (or an intermediary)
//! did not answer with JSON. Failures to obtain credentials are kept apart in
//! `AuthError` so they are never mistaken for a failure of the request itself.

use std::fmt;
use std::io;

use serde::Deserialize;
use thiserror::Error;

use crate::http::{HttpMethod, HttpResponse};

/// The server's answer to a request that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u16,
    pub url: String,
    pub error: Option<String>,
    pub reason: Option<String>,
    /// Body exactly as received.
    pub body: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    reason: Option<String>,
    /// IAM token service spelling of `error`.
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    /// IAM token service spelling of `reason`.
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

impl ErrorResponse {
    /// Builds an `ErrorResponse` from already-read body bytes.
    pub fn from_body(status: u16, url: &str, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body).into_owned();
        let (error, reason) = match serde_json::from_slice::<ErrorBody>(body) {
            Ok(parsed) => (parsed.error.or(parsed.error_code), parsed.reason.or(parsed.error_message)),
            Err(_) => (None, None),
        };
        let error = match (error, &reason) {
            (None, None) if !text.is_empty() => Some(text.clone()),
            (error, _) => error,
        };
        Self {
            status,
            url: url.to_string(),
            error,
            reason,
            body: text,
        }
    }

    /// What the server said went wrong, without status or URL.
    pub fn detail(&self) -> String {
        match (&self.error, &self.reason) {
            (Some(error), Some(reason)) => format!("{error}: {reason}"),
            (Some(error), None) => error.clone(),
            (None, Some(reason)) => reason.clone(),
            (None, None) => "empty response body".to_string(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {} from {}", self.status, self.url)?;
        if self.error.is_some() || self.reason.is_some() {
            write!(f, ": {}", self.detail())?;
        }
        Ok(())
    }
}

/// A failure to obtain credentials, kept separate per renewal hop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The IAM token endpoint did not issue a token.
    #[error("failed to obtain IAM token from {url}{}: {message}", status_suffix(.status))]
    Token {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// The server did not establish a session.
    #[error("failed to obtain session from {url}{}: {message}", status_suffix(.status))]
    Session {
        url: String,
        status: Option<u16>,
        message: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" (HTTP {code})")).unwrap_or_default()
}

impl AuthError {
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Token { status, .. } | AuthError::Session { status, .. } => *status,
        }
    }
}

/// Errors returned by the executor and the client.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server returned 404.
    #[error("not found: {0}")]
    NotFound(ErrorResponse),

    /// The server returned 409.
    #[error("conflict: {0}")]
    Conflict(ErrorResponse),

    /// The server returned 412.
    #[error("precondition failed: {0}")]
    PreconditionFailed(ErrorResponse),

    /// The server returned 429 and no replays were left.
    #[error("too many requests: {0}")]
    TooManyRequests(ErrorResponse),

    /// Any other non-2xx final response.
    #[error("{0}")]
    Http(ErrorResponse),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{method} {url} failed: {source}")]
    Transport {
        method: HttpMethod,
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{method} {url} timed out")]
    Timeout { method: HttpMethod, url: String },

    #[error("request was interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Classifies a final non-2xx response, reading its body at most once.
    pub fn from_response(url: &str, mut response: HttpResponse) -> Self {
        let status = response.status;
        let body = match response.buffer() {
            Ok(bytes) => ErrorResponse::from_body(status, url, bytes),
            Err(e) => return TransportError::Io(e),
        };
        match status {
            404 => TransportError::NotFound(body),
            409 => TransportError::Conflict(body),
            412 => TransportError::PreconditionFailed(body),
            429 => TransportError::TooManyRequests(body),
            _ => TransportError::Http(body),
        }
    }

    /// Status code of the server response or credential hop behind this error.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Auth(auth) => auth.status(),
            other => other.response().map(|r| r.status),
        }
    }

    pub fn response(&self) -> Option<&ErrorResponse> {
        match self {
            TransportError::NotFound(r)
            | TransportError::Conflict(r)
            | TransportError::PreconditionFailed(r)
            | TransportError::TooManyRequests(r)
            | TransportError::Http(r) => Some(r),
            _ => None,
        }
    }
}
