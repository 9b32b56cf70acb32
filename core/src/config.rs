//! Client configuration.
//!
//! `ClientConfig` is plain data: it deserializes from any serde source and can
//! be filled from `COUCH_*` environment variables. Runtime-only settings
//! (custom connections, extra interceptors) live on `CouchClientBuilder`.

use std::time::Duration;

use serde::Deserialize;

use crate::auth::DEFAULT_IAM_TOKEN_URL;
use crate::backoff::BackoffPolicy;
use crate::connection::{ConnectionConfig, ProxyConfig};
use crate::error::TransportError;
use crate::executor::DEFAULT_MAX_ATTEMPTS;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub iam_api_key: Option<String>,
    pub iam_token_url: String,
    pub iam_client_id: Option<String>,
    pub iam_client_secret: Option<String>,
    /// Total attempts per request, shared by every replay cause.
    pub max_attempts: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub backoff: BackoffPolicy,
    pub token_backoff: BackoffPolicy,
    pub user_agent: Option<String>,
    /// HTTP proxy for every request, including session and token requests.
    pub proxy_url: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5984".to_string(),
            username: None,
            password: None,
            iam_api_key: None,
            iam_token_url: DEFAULT_IAM_TOKEN_URL.to_string(),
            iam_client_id: None,
            iam_client_secret: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_timeout_secs: 300,
            read_timeout_secs: 300,
            backoff: BackoffPolicy::default(),
            token_backoff: BackoffPolicy::token_endpoint(),
            user_agent: None,
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Reads `COUCH_*` variables from the process environment.
    pub fn from_env() -> Result<Self, TransportError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TransportError> {
        let mut config = Self::default();
        if let Some(url) = lookup("COUCH_URL") {
            config.url = url;
        }
        config.username = lookup("COUCH_USERNAME");
        config.password = lookup("COUCH_PASSWORD");
        config.iam_api_key = lookup("COUCH_IAM_API_KEY");
        if let Some(token_url) = lookup("COUCH_IAM_TOKEN_URL") {
            config.iam_token_url = token_url;
        }
        config.iam_client_id = lookup("COUCH_IAM_CLIENT_ID");
        config.iam_client_secret = lookup("COUCH_IAM_CLIENT_SECRET");
        config.proxy_url = lookup("COUCH_PROXY_URL");
        config.proxy_username = lookup("COUCH_PROXY_USERNAME");
        config.proxy_password = lookup("COUCH_PROXY_PASSWORD");
        if let Some(attempts) = lookup("COUCH_MAX_ATTEMPTS") {
            config.max_attempts = attempts
                .trim()
                .parse()
                .map_err(|_| TransportError::Config(format!("COUCH_MAX_ATTEMPTS is not a number: {attempts}")))?;
        }
        Ok(config)
    }

    pub fn connection(&self) -> Result<ConnectionConfig, TransportError> {
        let proxy = match (&self.proxy_url, self.proxy_credentials()?) {
            (Some(url), Some((username, password))) => Some(ProxyConfig::new(url).credentials(username, password)),
            (Some(url), None) => Some(ProxyConfig::new(url)),
            (None, Some(_)) => {
                return Err(TransportError::Config(
                    "proxy credentials supplied without a proxy URL".to_string(),
                ))
            }
            (None, None) => None,
        };
        Ok(ConnectionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            proxy,
        })
    }

    /// Proxy user name and password, if both are set.
    pub fn proxy_credentials(&self) -> Result<Option<(&str, &str)>, TransportError> {
        match (self.proxy_username.as_deref(), self.proxy_password.as_deref()) {
            (Some(username), Some(password)) => Ok(Some((username, password))),
            (None, None) => Ok(None),
            _ => Err(TransportError::Config(
                "proxy username and password must be supplied together".to_string(),
            )),
        }
    }

    /// User name and password, if both are set.
    pub fn password_credentials(&self) -> Result<Option<(&str, &str)>, TransportError> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) => Ok(Some((username, password))),
            (None, None) => Ok(None),
            _ => Err(TransportError::Config(
                "username and password must be supplied together".to_string(),
            )),
        }
    }

    /// IAM client id and secret for the token endpoint, if both are set.
    pub fn iam_client_credentials(&self) -> Result<Option<(&str, &str)>, TransportError> {
        match (self.iam_client_id.as_deref(), self.iam_client_secret.as_deref()) {
            (Some(id), Some(secret)) => Ok(Some((id, secret))),
            (None, None) => Ok(None),
            _ => Err(TransportError::Config(
                "IAM client id and secret must be supplied together".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.connection().unwrap().read_timeout, Duration::from_secs(300));
        assert_eq!(config.connection().unwrap().proxy, None);
        assert_eq!(config.backoff.max_attempts, 4);
        assert_eq!(config.token_backoff.max_attempts, 3);
        assert_eq!(config.iam_token_url, DEFAULT_IAM_TOKEN_URL);
    }

    #[test]
    fn reads_environment() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("COUCH_URL", "https://acct.example.com"),
            ("COUCH_IAM_API_KEY", "key"),
            ("COUCH_IAM_TOKEN_URL", "http://127.0.0.1:9000/identity/token"),
            ("COUCH_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.url, "https://acct.example.com");
        assert_eq!(config.iam_api_key.as_deref(), Some("key"));
        assert_eq!(config.iam_token_url, "http://127.0.0.1:9000/identity/token");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.username, None);
    }

    #[test]
    fn proxy_settings_come_from_environment() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("COUCH_PROXY_URL", "http://proxy.example:3128"),
            ("COUCH_PROXY_USERNAME", "svc"),
            ("COUCH_PROXY_PASSWORD", "secret"),
        ]))
        .unwrap();
        let proxy = config.connection().unwrap().proxy.unwrap();
        assert_eq!(proxy, ProxyConfig::new("http://proxy.example:3128").credentials("svc", "secret"));
    }

    #[test]
    fn proxy_credentials_need_a_proxy_and_each_other() {
        let orphaned = ClientConfig {
            proxy_username: Some("svc".to_string()),
            proxy_password: Some("secret".to_string()),
            ..ClientConfig::default()
        };
        assert!(matches!(orphaned.connection(), Err(TransportError::Config(_))));

        let half = ClientConfig {
            proxy_url: Some("http://proxy.example:3128".to_string()),
            proxy_username: Some("svc".to_string()),
            ..ClientConfig::default()
        };
        assert!(matches!(half.connection(), Err(TransportError::Config(_))));
    }

    #[test]
    fn rejects_bad_attempt_count() {
        let err = ClientConfig::from_lookup(lookup(&[("COUCH_MAX_ATTEMPTS", "many")])).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn half_a_credential_pair_is_an_error() {
        let config = ClientConfig {
            username: Some("admin".to_string()),
            ..ClientConfig::default()
        };
        assert!(config.password_credentials().is_err());
        assert_eq!(ClientConfig::default().password_credentials().unwrap(), None);
    }

    #[test]
    fn deserializes_partial_json() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"url":"http://db:5984","backoff":{"max_attempts":10,"base_interval_millis":100}}"#,
        )
        .unwrap();
        assert_eq!(config.url, "http://db:5984");
        assert_eq!(config.backoff.max_attempts, 10);
        assert_eq!(config.backoff.multiplier, 2);
        assert_eq!(config.max_attempts, 10);
    }
}
