//! In-memory stand-in for a CouchDB server with cookie and IAM sessions.
//!
//! # Design
//! Every request passes through a recording layer that stores it and, if a
//! response has been scripted for its path, answers with that instead of the
//! normal handler. This is how tests inject `429`s or broken session
//! responses and then assert on exactly what the client sent.
//!
//! Sessions are opaque uuids. A request carrying a session cookie the server
//! no longer knows is answered with `403 credentials_expired`, which is what
//! `expire_sessions` relies on. Requests without a session cookie are served
//! as if the database were open to everyone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

const MAX_BODY: usize = 16 * 1024 * 1024;

/// Credentials the server accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConfig {
    pub username: String,
    pub password: String,
    pub api_key: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "pass".to_string(),
            api_key: "mock-api-key".to_string(),
        }
    }
}

impl MockConfig {
    /// Reads `MOCK_USERNAME`, `MOCK_PASSWORD` and `MOCK_API_KEY`, keeping the
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, default: String| std::env::var(name).unwrap_or(default);
        Self {
            username: var("MOCK_USERNAME", defaults.username),
            password: var("MOCK_PASSWORD", defaults.password),
            api_key: var("MOCK_API_KEY", defaults.api_key),
        }
    }
}

/// A request as received by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie").and_then(|cookies| find_cookie(cookies, name))
    }

    /// `"POST /_session"`
    pub fn line(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// A canned answer for the next request to a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// How long the server waits before answering.
    pub delay: Duration,
}

impl ScriptedResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashSet<String>,
    iam_sessions: HashSet<String>,
    tokens: HashSet<String>,
    scripted: HashMap<String, VecDeque<ScriptedResponse>>,
    recorded: Vec<RecordedRequest>,
    session_delay: Duration,
    session_max_age: Option<u64>,
}

/// Shared server state. Clones observe and control the same server.
#[derive(Clone, Default)]
pub struct MockCouch {
    config: Arc<MockConfig>,
    inner: Arc<Mutex<Inner>>,
}

impl MockCouch {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::default(),
        }
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Every request received so far, oldest first.
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.lock().recorded.clone()
    }

    pub fn clear_recorded(&self) {
        self.lock().recorded.clear();
    }

    /// Forgets every session so their cookies are rejected as expired.
    pub fn expire_sessions(&self) {
        let mut inner = self.lock();
        inner.sessions.clear();
        inner.iam_sessions.clear();
    }

    pub fn revoke_tokens(&self) {
        self.lock().tokens.clear();
    }

    /// Answers the next request to `path` with `response`. Responses queued
    /// for the same path are used in order.
    pub fn enqueue(&self, path: &str, response: ScriptedResponse) {
        self.lock()
            .scripted
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    /// Delays session and token issuance, widening the window for
    /// concurrent renewals.
    pub fn set_session_delay(&self, delay: Duration) {
        self.lock().session_delay = delay;
    }

    /// Adds `Max-Age` to issued session cookies.
    pub fn set_session_max_age(&self, seconds: Option<u64>) {
        self.lock().session_max_age = seconds;
    }

    fn session_delay(&self) -> Duration {
        self.lock().session_delay
    }

    fn issue(&self, cookie_name: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let mut inner = self.lock();
        match cookie_name {
            IAM_SESSION => inner.iam_sessions.insert(token.clone()),
            _ => inner.sessions.insert(token.clone()),
        };
        let max_age = inner
            .session_max_age
            .map(|seconds| format!("; Max-Age={seconds}"))
            .unwrap_or_default();
        format!("{cookie_name}={token}; Version=1{max_age}; Path=/; HttpOnly")
    }
}

const AUTH_SESSION: &str = "AuthSession";
const IAM_SESSION: &str = "IAMSession";

pub fn app(mock: MockCouch) -> Router {
    Router::new()
        .route("/_session", post(create_session).delete(delete_session))
        .route("/_iam_session", post(create_iam_session))
        .route("/identity/token", post(issue_token))
        .fallback(database)
        .layer(middleware::from_fn_with_state(mock.clone(), record))
        .with_state(mock)
}

pub async fn run(listener: TcpListener, mock: MockCouch) -> Result<(), std::io::Error> {
    axum::serve(listener, app(mock)).await
}

/// Starts the server on a random local port in a background thread.
pub fn serve_in_background(mock: MockCouch) -> std::io::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    std::thread::spawn(move || {
        let result = runtime.block_on(async {
            let listener = TcpListener::from_std(listener)?;
            run(listener, mock).await
        });
        if let Err(e) = result {
            error!(error = %e, "mock server stopped");
        }
    });
    info!(%addr, "mock server started");
    Ok(addr)
}

async fn record(State(mock): State<MockCouch>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    let path = parts.uri.path().to_string();
    let recorded = RecordedRequest {
        method: parts.method.to_string(),
        path: path.clone(),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect(),
        body: bytes.to_vec(),
    };
    debug!(request = %recorded.line(), "received");

    let scripted = {
        let mut inner = mock.lock();
        inner.recorded.push(recorded);
        inner.scripted.get_mut(&path).and_then(VecDeque::pop_front)
    };
    match scripted {
        Some(response) => {
            tokio::time::sleep(response.delay).await;
            response.into_response()
        }
        None => next.run(Request::from_parts(parts, Body::from(bytes))).await,
    }
}

fn find_cookie<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value.trim_matches('"'))
    })
}

fn request_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookies| find_cookie(cookies, name))
}

fn couch_error(status: StatusCode, error: &str, reason: &str) -> Response {
    (status, Json(json!({ "error": error, "reason": reason }))).into_response()
}

fn session_created(cookie: String, name: &str) -> Response {
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "ok": true, "name": name, "roles": ["_admin"] })),
    )
        .into_response()
}

async fn create_session(State(mock): State<MockCouch>, body: Bytes) -> Response {
    let form: HashMap<String, String> = url::form_urlencoded::parse(&body).into_owned().collect();
    tokio::time::sleep(mock.session_delay()).await;

    let config = mock.config();
    if form.get("name") != Some(&config.username) || form.get("password") != Some(&config.password) {
        return couch_error(StatusCode::UNAUTHORIZED, "unauthorized", "Name or password is incorrect.");
    }
    let cookie = mock.issue(AUTH_SESSION);
    session_created(cookie, &config.username)
}

async fn delete_session(State(mock): State<MockCouch>, headers: HeaderMap) -> Response {
    if let Some(token) = request_cookie(&headers, AUTH_SESSION) {
        mock.lock().sessions.remove(token);
    }
    (
        StatusCode::OK,
        [(header::SET_COOKIE, format!("{AUTH_SESSION}=; Version=1; Path=/; HttpOnly"))],
        Json(json!({ "ok": true })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct IamSessionRequest {
    access_token: String,
}

async fn create_iam_session(State(mock): State<MockCouch>, body: Bytes) -> Response {
    let Ok(request) = serde_json::from_slice::<IamSessionRequest>(&body) else {
        return couch_error(StatusCode::BAD_REQUEST, "bad_request", "Missing access_token.");
    };
    tokio::time::sleep(mock.session_delay()).await;

    if !mock.lock().tokens.contains(&request.access_token) {
        return couch_error(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid IAM access token.");
    }
    let cookie = mock.issue(IAM_SESSION);
    session_created(cookie, "iam-user")
}

async fn issue_token(State(mock): State<MockCouch>, body: Bytes) -> Response {
    let form: HashMap<String, String> = url::form_urlencoded::parse(&body).into_owned().collect();
    if form.get("grant_type").map(String::as_str) != Some("urn:ibm:params:oauth:grant-type:apikey")
        || form.get("apikey") != Some(&mock.config().api_key)
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "errorCode": "BXNIM0415E",
                "errorMessage": "Provided API key could not be found",
            })),
        )
            .into_response();
    }

    let token = Uuid::new_v4().simple().to_string();
    mock.lock().tokens.insert(token.clone());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    Json(json!({
        "access_token": token,
        "refresh_token": "not-supported",
        "token_type": "Bearer",
        "expires_in": 3600,
        "expiration": now + 3600,
    }))
    .into_response()
}

/// Any other path: checks the session cookie, then answers generically.
async fn database(State(mock): State<MockCouch>, request: Request) -> Response {
    let headers = request.headers();
    let auth = request_cookie(headers, AUTH_SESSION).map(|token| (AUTH_SESSION, token.to_string()));
    let iam = request_cookie(headers, IAM_SESSION).map(|token| (IAM_SESSION, token.to_string()));
    if let Some((name, token)) = auth.or(iam) {
        let inner = mock.lock();
        let known = match name {
            IAM_SESSION => inner.iam_sessions.contains(&token),
            _ => inner.sessions.contains(&token),
        };
        if !known {
            return couch_error(StatusCode::FORBIDDEN, "credentials_expired", "Session expired");
        }
    }

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    if path == "/" {
        return Json(json!({ "couchdb": "Welcome", "version": "3.3.3", "vendor": { "name": "mock" } }))
            .into_response();
    }
    let received = match to_bytes(request.into_body(), MAX_BODY).await {
        Ok(bytes) => bytes.len(),
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    Json(json!({ "ok": true, "method": method, "path": path, "received": received })).into_response()
}
