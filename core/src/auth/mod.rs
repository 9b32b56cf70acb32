//! Session authentication.
//!
//! # Overview
//! Both supported schemes end in the same place: a session cookie obtained
//! from the server and attached to every request. They differ only in how the
//! cookie is acquired, which is what a `SessionSource` describes:
//!
//! - `PasswordSession` posts a user name and password to `/_session`.
//! - `IamSession` exchanges an API key for an IAM token, then the token for a
//!   cookie at `/_iam_session`.
//!
//! `SessionInterceptor` drives either source: it attaches the cached cookie
//! (acquiring one first if there is none) and, when the server reports the
//! session as expired, renews it and asks for a replay. A fresh cookie the
//! server sets on an ordinary response replaces the cached one.

mod basic;
mod cache;
mod cookie;
mod iam;
mod session;

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

pub use basic::BasicAuthInterceptor;
pub use cache::{Cached, Expiring, SessionCache};
pub use cookie::{CookieAuthInterceptor, PasswordSession, AUTH_SESSION_COOKIE};
pub use iam::{IamAuthInterceptor, IamSession, IamToken, DEFAULT_IAM_TOKEN_URL, IAM_SESSION_COOKIE};
pub use session::{establish, parse_set_cookie, SessionCredential};

use crate::error::{AuthError, TransportError};
use crate::http::HttpResponse;
use crate::interceptor::{Decision, Exchange, Interceptor};

/// Where session cookies come from.
pub trait SessionSource: Send + Sync {
    /// Short name used in log output.
    fn scheme(&self) -> &'static str;

    /// Name of the session cookie this source obtains.
    fn cookie_name(&self) -> &'static str;

    /// Performs the network round trip(s) that yield a new session.
    fn acquire(&self) -> Result<Expiring<SessionCredential>, AuthError>;

    /// Ends `credential` on the server. Failures are logged, not returned.
    fn terminate(&self, _credential: &SessionCredential) {}

    /// Forgets any intermediate credentials.
    fn reset(&self) {}
}

#[derive(Deserialize)]
struct ErrorCode {
    error: Option<String>,
}

/// True for the 403 body CouchDB returns when a session cookie has expired.
pub fn is_credentials_expired(body: &[u8]) -> bool {
    serde_json::from_slice::<ErrorCode>(body)
        .ok()
        .and_then(|code| code.error)
        .is_some_and(|error| error == "credentials_expired")
}

/// Per-request record of the credential each attempt carried.
#[derive(Default)]
struct SessionSlot {
    used: Option<u64>,
    /// Credential the next attempt must use: the one this request renewed.
    pinned: Option<Arc<Cached<SessionCredential>>>,
}

/// Attaches and renews a session cookie obtained from `S`.
pub struct SessionInterceptor<S> {
    source: S,
    cache: SessionCache<SessionCredential>,
}

impl<S: SessionSource> SessionInterceptor<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: SessionCache::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cache(&self) -> &SessionCache<SessionCredential> {
        &self.cache
    }

    /// Stores the session cookie the server set on a response, if it differs
    /// from the cached one.
    fn refresh_from(&self, response: &HttpResponse) {
        let Some(cookie) = parse_set_cookie(response, self.source.cookie_name()) else {
            return;
        };
        if cookie.value.is_empty() {
            return;
        }
        if self.cache.current().is_some_and(|current| current.value.token == cookie.value) {
            return;
        }
        let credential = SessionCredential::new(self.source.cookie_name(), cookie.value);
        if let Some(cached) = self.cache.replace(Expiring::new(credential, cookie.expires_at)) {
            debug!(scheme = self.source.scheme(), generation = cached.generation, "server refreshed session cookie");
        }
    }

    /// Ends the current session on the server, best effort, and empties the caches.
    pub fn shutdown(&self) {
        if let Some(current) = self.cache.current() {
            self.source.terminate(&current.value);
        }
        self.cache.clear();
        self.source.reset();
    }
}

impl<S: SessionSource> Interceptor for SessionInterceptor<S> {
    fn name(&self) -> &'static str {
        self.source.scheme()
    }

    fn intercept_request(&self, exchange: &mut Exchange<'_>) -> Result<(), TransportError> {
        let pinned = exchange.state_mut::<SessionSlot>().pinned.take();
        let credential = match pinned {
            Some(credential) => credential,
            None => self.cache.get_or_renew(|| self.source.acquire())?,
        };

        let pair = credential.value.cookie_pair();
        let cookie = match exchange.header("cookie") {
            Some(existing) => format!("{existing}; {pair}"),
            None => pair,
        };
        exchange.set_header("Cookie", cookie);
        exchange.state_mut::<SessionSlot>().used = Some(credential.generation);
        Ok(())
    }

    fn intercept_response(
        &self,
        exchange: &mut Exchange<'_>,
        response: &mut HttpResponse,
    ) -> Result<Decision, TransportError> {
        let expired = match response.status {
            401 => true,
            403 => is_credentials_expired(response.buffer()?),
            _ => false,
        };
        if !expired {
            self.refresh_from(response);
            return Ok(Decision::Continue);
        }

        let used = exchange.state_mut::<SessionSlot>().used;
        info!(scheme = self.source.scheme(), status = response.status, "session rejected, renewing");
        if let Some(generation) = used {
            // Requests starting from now wait for the renewal instead of
            // sending the rejected cookie.
            self.cache.invalidate(generation);
        }
        let renewed = self.cache.renew_unless_replaced(used, || self.source.acquire())?;
        debug!(generation = renewed.generation, "replaying with renewed session");
        exchange.state_mut::<SessionSlot>().pinned = Some(renewed);
        Ok(Decision::Replay)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::connection::Connection;
    use crate::executor::RequestExecutor;
    use crate::http::{HttpMethod, HttpRequest};
    use crate::interceptor::InterceptorChain;
    use crate::test_support::{reply, Reply, ScriptedConnection};

    /// Hands out `token-1`, `token-2`, ... without any network traffic.
    #[derive(Default)]
    struct Counting {
        issued: AtomicUsize,
    }

    impl SessionSource for Counting {
        fn scheme(&self) -> &'static str {
            "counting"
        }

        fn cookie_name(&self) -> &'static str {
            "AuthSession"
        }

        fn acquire(&self) -> Result<Expiring<SessionCredential>, AuthError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Expiring::new(SessionCredential::new("AuthSession", format!("token-{n}")), None))
        }
    }

    type Outcome = (
        Arc<ScriptedConnection>,
        Arc<SessionInterceptor<Counting>>,
        Result<HttpResponse, TransportError>,
    );

    fn run(replies: Vec<Reply>) -> Outcome {
        let connection = Arc::new(ScriptedConnection::new(replies));
        let auth = Arc::new(SessionInterceptor::new(Counting::default()));
        let chain = InterceptorChain::new().with(Arc::clone(&auth) as Arc<dyn Interceptor>);
        let executor = RequestExecutor::new(Arc::clone(&connection) as Arc<dyn Connection>, chain);
        let result = executor.execute(HttpRequest::new(HttpMethod::Get, "http://couch/db"));
        (connection, auth, result)
    }

    #[test]
    fn credentials_expired_marker() {
        assert!(is_credentials_expired(br#"{"error":"credentials_expired","reason":"Session expired"}"#));
        assert!(!is_credentials_expired(br#"{"error":"forbidden"}"#));
        assert!(!is_credentials_expired(b"<html>credentials_expired</html>"));
    }

    #[test]
    fn expired_session_is_renewed_and_replayed_once() {
        let (connection, auth, result) = run(vec![
            reply(403, r#"{"error":"credentials_expired","reason":"Session expired"}"#),
            reply(200, "{}"),
        ]);
        assert_eq!(result.unwrap().status, 200);

        let attempts = connection.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].header("cookie"), Some("AuthSession=token-1"));
        assert_eq!(attempts[1].header("cookie"), Some("AuthSession=token-2"));
        assert_eq!(auth.source().issued.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unauthorized_also_triggers_renewal() {
        let (connection, _auth, result) = run(vec![reply(401, ""), reply(200, "{}")]);
        assert!(result.is_ok());
        assert_eq!(connection.attempts()[1].header("cookie"), Some("AuthSession=token-2"));
    }

    #[test]
    fn other_forbidden_is_surfaced_untouched() {
        let body = r#"{"error":"forbidden","reason":"You are not allowed to access this db."}"#;
        let (connection, auth, result) = run(vec![reply(403, body), reply(200, "{}")]);
        let err = result.unwrap_err();
        let response = err.response().unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(response.error.as_deref(), Some("forbidden"));
        assert_eq!(response.body, body);
        assert_eq!(connection.attempts().len(), 1);
        assert_eq!(auth.source().issued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_cookie_is_reused_without_renewal() {
        let connection = Arc::new(ScriptedConnection::new(vec![reply(200, ""), reply(200, "")]));
        let auth = Arc::new(SessionInterceptor::new(Counting::default()));
        let chain = InterceptorChain::new().with(Arc::clone(&auth) as Arc<dyn Interceptor>);
        let executor = RequestExecutor::new(Arc::clone(&connection) as Arc<dyn Connection>, chain);
        for _ in 0..2 {
            executor
                .execute(HttpRequest::new(HttpMethod::Get, "http://couch/").header("Cookie", "theme=dark"))
                .unwrap();
        }
        assert_eq!(auth.source().issued.load(Ordering::SeqCst), 1);
        assert_eq!(connection.attempts()[1].header("cookie"), Some("theme=dark; AuthSession=token-1"));
    }

    /// Runs ahead of the session interceptor and, on the replay, completes
    /// another renewal before the replayed attempt is decorated.
    struct RenewBeforeReplay(Arc<SessionInterceptor<Counting>>);

    impl Interceptor for RenewBeforeReplay {
        fn name(&self) -> &'static str {
            "renew-before-replay"
        }

        fn intercept_request(&self, exchange: &mut Exchange<'_>) -> Result<(), TransportError> {
            if exchange.attempt() == 2 {
                let auth = &self.0;
                let current = auth.cache().current().unwrap();
                auth.cache().renew_unless_replaced(Some(current.generation), || auth.source().acquire())?;
            }
            Ok(())
        }
    }

    #[test]
    fn replay_uses_its_own_renewal_not_a_newer_one() {
        let connection = Arc::new(ScriptedConnection::new(vec![
            reply(403, r#"{"error":"credentials_expired"}"#),
            reply(200, "{}"),
        ]));
        let auth = Arc::new(SessionInterceptor::new(Counting::default()));
        let chain = InterceptorChain::new()
            .with(Arc::new(RenewBeforeReplay(Arc::clone(&auth))))
            .with(Arc::clone(&auth) as Arc<dyn Interceptor>);
        let executor = RequestExecutor::new(Arc::clone(&connection) as Arc<dyn Connection>, chain);
        executor
            .execute(HttpRequest::new(HttpMethod::Get, "http://couch/db"))
            .unwrap();

        let attempts = connection.attempts();
        assert_eq!(attempts[0].header("cookie"), Some("AuthSession=token-1"));
        assert_eq!(attempts[1].header("cookie"), Some("AuthSession=token-2"));
        assert_eq!(auth.cache().current().unwrap().value.token, "token-3");
    }

    #[test]
    fn rejected_cookie_is_withdrawn_before_renewal() {
        /// Reports whether the cache still offered a usable cookie while
        /// renewing.
        #[derive(Default)]
        struct Observing {
            inner: Counting,
            cache_seen_usable: parking_lot::Mutex<Vec<bool>>,
            auth: parking_lot::Mutex<Option<std::sync::Weak<SessionInterceptor<Observing>>>>,
        }

        impl SessionSource for Observing {
            fn scheme(&self) -> &'static str {
                "observing"
            }

            fn cookie_name(&self) -> &'static str {
                "AuthSession"
            }

            fn acquire(&self) -> Result<Expiring<SessionCredential>, AuthError> {
                if let Some(auth) = self.auth.lock().as_ref().and_then(std::sync::Weak::upgrade) {
                    self.cache_seen_usable.lock().push(auth.cache().usable().is_some());
                }
                self.inner.acquire()
            }
        }

        let connection = Arc::new(ScriptedConnection::new(vec![
            reply(403, r#"{"error":"credentials_expired"}"#),
            reply(200, "{}"),
        ]));
        let auth = Arc::new(SessionInterceptor::new(Observing::default()));
        *auth.source().auth.lock() = Some(Arc::downgrade(&auth));
        let chain = InterceptorChain::new().with(Arc::clone(&auth) as Arc<dyn Interceptor>);
        let executor = RequestExecutor::new(Arc::clone(&connection) as Arc<dyn Connection>, chain);
        executor
            .execute(HttpRequest::new(HttpMethod::Get, "http://couch/db"))
            .unwrap();

        // First acquisition: empty cache. Renewal: token-1 already withdrawn.
        assert_eq!(*auth.source().cache_seen_usable.lock(), vec![false, false]);
    }

    #[test]
    fn cookie_refreshed_by_server_is_adopted() {
        let connection = Arc::new(ScriptedConnection::new(vec![
            reply(200, "{}").with_header("Set-Cookie", "AuthSession=refreshed; Version=1; Path=/; HttpOnly"),
            reply(200, "{}"),
        ]));
        let auth = Arc::new(SessionInterceptor::new(Counting::default()));
        let chain = InterceptorChain::new().with(Arc::clone(&auth) as Arc<dyn Interceptor>);
        let executor = RequestExecutor::new(Arc::clone(&connection) as Arc<dyn Connection>, chain);
        for _ in 0..2 {
            executor
                .execute(HttpRequest::new(HttpMethod::Get, "http://couch/db"))
                .unwrap();
        }

        let attempts = connection.attempts();
        assert_eq!(attempts[0].header("cookie"), Some("AuthSession=token-1"));
        assert_eq!(attempts[1].header("cookie"), Some("AuthSession=refreshed"));
        assert_eq!(auth.source().issued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_cookies_and_cleared_cookies_are_ignored() {
        let connection = Arc::new(ScriptedConnection::new(vec![
            reply(200, "{}").with_header("Set-Cookie", "tracking=abc; Path=/"),
            reply(200, "{}").with_header("Set-Cookie", "AuthSession=; Max-Age=0; Path=/"),
            reply(200, "{}"),
        ]));
        let auth = Arc::new(SessionInterceptor::new(Counting::default()));
        let chain = InterceptorChain::new().with(Arc::clone(&auth) as Arc<dyn Interceptor>);
        let executor = RequestExecutor::new(Arc::clone(&connection) as Arc<dyn Connection>, chain);
        for _ in 0..3 {
            executor
                .execute(HttpRequest::new(HttpMethod::Get, "http://couch/db"))
                .unwrap();
        }
        assert_eq!(connection.attempts()[2].header("cookie"), Some("AuthSession=token-1"));
    }

    #[test]
    fn shutdown_clears_the_cache() {
        let (_connection, auth, _result) = run(vec![reply(200, "")]);
        assert!(auth.cache().current().is_some());
        auth.shutdown();
        assert!(auth.cache().current().is_none());
    }
}
