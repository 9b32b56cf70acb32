//! HTTP transport types shared by the executor, interceptors and connections.
//!
//! # Design
//! Requests and responses are described as plain data. Headers are an ordered
//! `Vec` of name/value pairs so multi-valued headers (`Set-Cookie`) keep their
//! order; lookups are case-insensitive. A response body starts out as a lazy
//! reader and is buffered at most once, the first time an interceptor or the
//! error classifier needs to look at it.

use std::fmt;
use std::io::{self, Read};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::body::RequestBody;
use crate::connection::Timeouts;
use crate::error::TransportError;
use crate::interrupt::Interrupt;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the first value of `name` in `headers`, ignoring case.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Replaces every value of `name` with a single `value`.
pub fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: impl Into<String>) {
    headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.into()));
}

/// An outbound request: one logical call that may be sent several times.
///
/// Headers set here are the baseline for every attempt; interceptors start
/// from a fresh copy on each attempt so a renewed cookie replaces the stale one.
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Total attempts allowed for this request. `None` uses the executor default.
    pub max_attempts: Option<u32>,
    pub interrupt: Option<Interrupt>,
    /// Overrides the connection's timeouts for every attempt of this request.
    pub timeouts: Timeouts,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            max_attempts: None,
            interrupt: None,
            timeouts: Timeouts::default(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes `value` as the JSON body and sets `Content-Type`.
    pub fn json<T: serde::Serialize>(self, value: &T) -> Result<Self, TransportError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self
            .header("Content-Type", "application/json")
            .body(RequestBody::from(bytes)))
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn interruptible(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.read = Some(timeout);
        self
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers.len())
            .field("body", &self.body)
            .field("max_attempts", &self.max_attempts)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

enum ResponseBody {
    Stream(Box<dyn Read + Send>),
    Buffered(Vec<u8>),
}

/// An HTTP response whose body is read lazily.
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body: ResponseBody,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Read + Send + 'static) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Stream(Box::new(body)),
        }
    }

    pub fn from_bytes(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Buffered(body.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Reads the body into memory on first call and returns it on every call.
    pub fn buffer(&mut self) -> io::Result<&[u8]> {
        if let ResponseBody::Stream(reader) = &mut self.body {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            self.body = ResponseBody::Buffered(bytes);
        }
        match &self.body {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Stream(_) => Err(io::Error::other("response body was not buffered")),
        }
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        match self.body {
            ResponseBody::Stream(reader) => reader,
            ResponseBody::Buffered(bytes) => Box::new(io::Cursor::new(bytes)),
        }
    }

    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        self.buffer()?;
        match self.body {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Stream(_) => Ok(Vec::new()),
        }
    }

    pub fn into_string(self) -> io::Result<String> {
        String::from_utf8(self.into_bytes()?).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn into_json<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        let bytes = self.into_bytes()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Drains and drops the body so the underlying connection can be reused.
    pub(crate) fn discard(self) {
        if let ResponseBody::Stream(mut reader) = self.body {
            let _ = io::copy(&mut reader, &mut io::sink());
        }
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ResponseBody::Stream(_) => "<stream>".to_string(),
            ResponseBody::Buffered(bytes) => format!("<{} bytes>", bytes.len()),
        };
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &body)
            .finish()
    }
}
