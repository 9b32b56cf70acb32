//! IAM sessions: API key → IAM token → `IAMSession` cookie.
//!
//! # Design
//! The token is an intermediate credential with its own cache, so renewing an
//! expired cookie reuses a still-valid token and the token endpoint is only
//! hit when the token itself expires or is rejected. The token endpoint is
//! reached through its own executor, which carries a separate, smaller
//! backoff policy than the outer requests.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing::{debug, error};

use super::cache::{Expiring, SessionCache};
use super::session::{establish, SessionCredential};
use super::{SessionInterceptor, SessionSource};
use crate::error::{AuthError, ErrorResponse};
use crate::executor::RequestExecutor;
use crate::http::{HttpMethod, HttpRequest};

pub const IAM_SESSION_COOKIE: &str = "IAMSession";

pub const DEFAULT_IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";

/// Tokens are renewed this long before the expiry the token service reports.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Cookie authentication with an IAM API key.
pub type IamAuthInterceptor = SessionInterceptor<IamSession>;

#[derive(Clone, PartialEq, Eq)]
pub struct IamToken {
    access_token: String,
}

impl IamToken {
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for IamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IamToken(<redacted>)")
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Absolute expiry, seconds since the epoch.
    expiration: Option<u64>,
    /// Relative expiry in seconds.
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn expires_at(&self) -> Option<SystemTime> {
        // Times past what `SystemTime` can hold are treated as never expiring.
        let reported = match (self.expiration, self.expires_in) {
            (Some(at), _) => UNIX_EPOCH.checked_add(Duration::from_secs(at))?,
            (None, Some(seconds)) => SystemTime::now().checked_add(Duration::from_secs(seconds))?,
            (None, None) => return None,
        };
        Some(reported.checked_sub(EXPIRY_MARGIN).unwrap_or(UNIX_EPOCH))
    }
}

pub struct IamSession {
    api_key: String,
    token_url: String,
    session_url: String,
    token_executor: RequestExecutor,
    session_executor: RequestExecutor,
    tokens: SessionCache<IamToken>,
}

impl IamSession {
    /// `token_executor` reaches the IAM token service and `session_executor`
    /// the database; neither may contain the interceptor this source feeds.
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        token_url: impl Into<String>,
        token_executor: RequestExecutor,
        session_executor: RequestExecutor,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            token_url: token_url.into(),
            session_url: format!("{}/_iam_session", base_url.trim_end_matches('/')),
            token_executor,
            session_executor,
            tokens: SessionCache::new(),
        }
    }

    pub fn session_url(&self) -> &str {
        &self.session_url
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    pub fn tokens(&self) -> &SessionCache<IamToken> {
        &self.tokens
    }

    fn token_failure(&self, status: Option<u16>, message: String) -> AuthError {
        AuthError::Token {
            url: self.token_url.clone(),
            status,
            message,
        }
    }

    fn session_failure(&self, status: Option<u16>, message: String) -> AuthError {
        AuthError::Session {
            url: self.session_url.clone(),
            status,
            message,
        }
    }

    fn fetch_token(&self) -> Result<Expiring<IamToken>, AuthError> {
        debug!(url = %self.token_url, "requesting IAM token");
        let body = format!(
            "grant_type=urn:ibm:params:oauth:grant-type:apikey&response_type=cloud_iam&apikey={}",
            urlencoding::encode(&self.api_key)
        );
        let request = HttpRequest::new(HttpMethod::Post, &self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(body);
        let mut response = self
            .token_executor
            .exchange(request)
            .map_err(|e| self.token_failure(e.status(), e.to_string()))?;

        let status = response.status;
        if !response.is_success() {
            let body = response
                .buffer()
                .map_err(|e| self.token_failure(Some(status), e.to_string()))?;
            let message = ErrorResponse::from_body(status, &self.token_url, body).detail();
            error!(status, "IAM token request rejected");
            return Err(self.token_failure(Some(status), message));
        }

        let token: TokenResponse = response
            .into_json()
            .map_err(|e| self.token_failure(Some(status), format!("unreadable token response: {e}")))?;
        let expires_at = token.expires_at();
        Ok(Expiring::new(
            IamToken {
                access_token: token.access_token,
            },
            expires_at,
        ))
    }
}

impl SessionSource for IamSession {
    fn scheme(&self) -> &'static str {
        "iam"
    }

    fn cookie_name(&self) -> &'static str {
        IAM_SESSION_COOKIE
    }

    fn acquire(&self) -> Result<Expiring<SessionCredential>, AuthError> {
        let token = self.tokens.get_or_renew(|| self.fetch_token())?;

        let body = serde_json::to_vec(&serde_json::json!({ "access_token": token.value.access_token }))
            .map_err(|e| self.session_failure(None, e.to_string()))?;
        let request = HttpRequest::new(HttpMethod::Post, &self.session_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body);
        let response = self
            .session_executor
            .exchange(request)
            .map_err(|e| self.session_failure(e.status(), e.to_string()))?;

        if (400..500).contains(&response.status) && response.status != 429 {
            // The token may have been revoked; fetch a new one next time.
            self.tokens.invalidate(token.generation);
        }
        establish(&self.session_url, IAM_SESSION_COOKIE, response)
    }

    fn reset(&self) {
        self.tokens.clear();
    }
}
