//! In-memory `Connection` for unit tests.

use std::collections::VecDeque;
use std::io;

use parking_lot::Mutex;

use crate::connection::{Attempt, Connection, Timeouts};
use crate::error::TransportError;
use crate::http::{HttpMethod, HttpResponse};

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Reply {
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub fn reply(status: u16, body: &str) -> Reply {
    Reply {
        status,
        headers: Vec::new(),
        body: body.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct RecordedAttempt {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeouts: Timeouts,
}

impl RecordedAttempt {
    pub fn header(&self, name: &str) -> Option<&str> {
        crate::http::header_value(&self.headers, name)
    }
}

/// Answers attempts from a fixed script and records what was sent.
pub struct ScriptedConnection {
    replies: Mutex<VecDeque<Reply>>,
    attempts: Mutex<Vec<RecordedAttempt>>,
    fail: bool,
}

impl ScriptedConnection {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            attempts: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// Every attempt fails at the transport level.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn attempts(&self) -> Vec<RecordedAttempt> {
        self.attempts.lock().clone()
    }
}

impl Connection for ScriptedConnection {
    fn send(&self, attempt: Attempt<'_>) -> Result<HttpResponse, TransportError> {
        let recorded = RecordedAttempt {
            method: attempt.method,
            url: attempt.url.to_string(),
            headers: attempt.headers.to_vec(),
            body: attempt.body.into_bytes()?,
            timeouts: attempt.timeouts,
        };
        self.attempts.lock().push(recorded);

        if self.fail {
            return Err(TransportError::Transport {
                method: attempt.method,
                url: attempt.url.to_string(),
                source: Box::new(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")),
            });
        }
        let reply = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::InvalidRequest(format!("no scripted reply for {}", attempt.url)))?;
        Ok(HttpResponse::new(reply.status, reply.headers, io::Cursor::new(reply.body.into_bytes())))
    }
}
