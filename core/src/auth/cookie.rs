//! Password sessions at `/_session`.

use tracing::{debug, warn};

use super::cache::Expiring;
use super::session::{establish, SessionCredential};
use super::{SessionInterceptor, SessionSource};
use crate::error::AuthError;
use crate::executor::RequestExecutor;
use crate::http::{HttpMethod, HttpRequest};

pub const AUTH_SESSION_COOKIE: &str = "AuthSession";

/// Cookie authentication with a user name and password.
pub type CookieAuthInterceptor = SessionInterceptor<PasswordSession>;

/// Obtains `AuthSession` cookies by posting credentials to `<base>/_session`.
pub struct PasswordSession {
    username: String,
    password: String,
    session_url: String,
    executor: RequestExecutor,
}

impl PasswordSession {
    /// `executor` carries the session requests; it must not contain the
    /// interceptor this source is plugged into.
    pub fn new(base_url: &str, username: impl Into<String>, password: impl Into<String>, executor: RequestExecutor) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            session_url: format!("{}/_session", base_url.trim_end_matches('/')),
            executor,
        }
    }

    pub fn session_url(&self) -> &str {
        &self.session_url
    }

    fn form_body(&self) -> String {
        format!(
            "name={}&password={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password)
        )
    }
}

impl SessionSource for PasswordSession {
    fn scheme(&self) -> &'static str {
        "cookie"
    }

    fn cookie_name(&self) -> &'static str {
        AUTH_SESSION_COOKIE
    }

    fn acquire(&self) -> Result<Expiring<SessionCredential>, AuthError> {
        debug!(url = %self.session_url, "requesting session");
        let request = HttpRequest::new(HttpMethod::Post, &self.session_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(self.form_body());
        let response = self.executor.exchange(request).map_err(|e| AuthError::Session {
            url: self.session_url.clone(),
            status: e.status(),
            message: e.to_string(),
        })?;
        establish(&self.session_url, AUTH_SESSION_COOKIE, response)
    }

    fn terminate(&self, credential: &SessionCredential) {
        let request = HttpRequest::new(HttpMethod::Delete, &self.session_url)
            .header("Cookie", credential.cookie_pair())
            .header("Accept", "application/json")
            .max_attempts(1);
        match self.executor.exchange(request) {
            Ok(response) if response.is_success() => debug!("session terminated"),
            Ok(response) => warn!(status = response.status, "session termination rejected"),
            Err(e) => warn!(error = %e, "session termination failed"),
        }
    }
}
