//! Session cookies: what the server hands out and how a session response is
//! judged.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::trace;

use super::cache::Expiring;
use crate::error::{AuthError, ErrorResponse};
use crate::http::HttpResponse;

/// A server-issued session cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub cookie_name: String,
    pub token: String,
}

impl SessionCredential {
    pub fn new(cookie_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            token: token.into(),
        }
    }

    /// `name=token`, as sent in a `Cookie` header.
    pub fn cookie_pair(&self) -> String {
        format!("{}={}", self.cookie_name, self.token)
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("cookie_name", &self.cookie_name)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Finds `cookie_name` among the `Set-Cookie` headers and returns its value
/// and the expiry implied by `Max-Age`.
pub fn parse_set_cookie(response: &HttpResponse, cookie_name: &str) -> Option<Expiring<String>> {
    response.header_values("set-cookie").find_map(|header| {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.trim().split_once('=')?;
        if name.trim() != cookie_name {
            return None;
        }

        let max_age = parts.find_map(|attribute| {
            let (key, seconds) = attribute.trim().split_once('=')?;
            if !key.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            seconds.trim().parse::<i64>().ok()
        });
        let expires_at = max_age.and_then(expiry_after);
        trace!(cookie = name, has_expiry = expires_at.is_some(), "session cookie received");
        Some(Expiring::new(value.trim().to_string(), expires_at))
    })
}

/// Expiry `max_age` seconds from now. Zero or negative means already expired;
/// an age too large to represent means no expiry at all.
fn expiry_after(max_age: i64) -> Option<SystemTime> {
    let now = SystemTime::now();
    match u64::try_from(max_age) {
        Ok(seconds) => now.checked_add(Duration::from_secs(seconds)),
        Err(_) => Some(now),
    }
}

#[derive(Deserialize)]
struct SessionBody {
    ok: Option<bool>,
}

/// Turns the response of a session request into a credential.
///
/// The response must be 2xx, must not report `"ok": false` and must set
/// `cookie_name`.
pub fn establish(url: &str, cookie_name: &str, mut response: HttpResponse) -> Result<Expiring<SessionCredential>, AuthError> {
    let failure = |status: Option<u16>, message: String| AuthError::Session {
        url: url.to_string(),
        status,
        message,
    };

    let status = response.status;
    let success = response.is_success();
    let body = response.buffer().map_err(|e| failure(Some(status), e.to_string()))?;
    if !success {
        let message = ErrorResponse::from_body(status, url, body).detail();
        return Err(failure(Some(status), message));
    }
    if let Ok(SessionBody { ok: Some(false) }) = serde_json::from_slice::<SessionBody>(body) {
        return Err(failure(Some(status), "server reported ok: false".to_string()));
    }

    let cookie = parse_set_cookie(&response, cookie_name)
        .ok_or_else(|| failure(Some(status), format!("response did not set a {cookie_name} cookie")))?;
    Ok(Expiring::new(SessionCredential::new(cookie_name, cookie.value), cookie.expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, set_cookie: &[&str], body: &str) -> HttpResponse {
        let headers = set_cookie
            .iter()
            .map(|value| ("Set-Cookie".to_string(), value.to_string()))
            .collect();
        HttpResponse::from_bytes(status, headers, body)
    }

    #[test]
    fn picks_the_named_cookie_among_several() {
        let response = response(
            200,
            &["tracking=abc; Path=/", "AuthSession=dXNlcjo1; Version=1; Path=/; HttpOnly"],
            "{\"ok\":true}",
        );
        let cookie = parse_set_cookie(&response, "AuthSession").unwrap();
        assert_eq!(cookie.value, "dXNlcjo1");
        assert_eq!(cookie.expires_at, None);
        assert!(parse_set_cookie(&response, "IAMSession").is_none());
    }

    #[test]
    fn max_age_sets_expiry() {
        let response = response(200, &["IAMSession=t0k3n; Max-Age=3600; Path=/"], "");
        let cookie = parse_set_cookie(&response, "IAMSession").unwrap();
        let expires_at = cookie.expires_at.unwrap();
        assert!(expires_at > SystemTime::now() + Duration::from_secs(3500));

        let expired = parse_set_cookie(&self::response(200, &["IAMSession=x; max-age=-1"], ""), "IAMSession").unwrap();
        assert!(expired.expires_at.unwrap() <= SystemTime::now());
    }

    #[test]
    fn huge_max_age_never_expires() {
        let response = response(200, &["AuthSession=x; Max-Age=9223372036854775807; Path=/"], "");
        let cookie = parse_set_cookie(&response, "AuthSession").unwrap();
        assert_eq!(cookie.value, "x");
        assert_eq!(cookie.expires_at, None);
    }

    #[test]
    fn establish_accepts_ok_session() {
        let session = establish(
            "http://localhost:5984/_session",
            "AuthSession",
            response(200, &["AuthSession=abc; Path=/"], "{\"ok\":true,\"name\":\"admin\"}"),
        )
        .unwrap();
        assert_eq!(session.value.cookie_pair(), "AuthSession=abc");
    }

    #[test]
    fn establish_rejects_ok_false_and_missing_cookie() {
        let url = "http://localhost:5984/_session";
        let err = establish(url, "AuthSession", response(200, &["AuthSession=abc"], "{\"ok\":false}")).unwrap_err();
        assert_eq!(err.status(), Some(200));

        let err = establish(url, "AuthSession", response(200, &[], "{\"ok\":true}")).unwrap_err();
        assert!(err.to_string().contains("did not set a AuthSession cookie"));
    }

    #[test]
    fn establish_reports_server_error() {
        let err = establish(
            "http://localhost:5984/_session",
            "AuthSession",
            response(401, &[], "{\"error\":\"unauthorized\",\"reason\":\"Name or password is incorrect.\"}"),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::Session { status: Some(401), .. }));
        assert!(err.to_string().contains("Name or password is incorrect."));
    }

    #[test]
    fn debug_output_hides_token() {
        let credential = SessionCredential::new("AuthSession", "secret-token");
        assert!(!format!("{credential:?}").contains("secret-token"));
    }
}
