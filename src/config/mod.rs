//! Server configuration and deployment metadata.
//!
//! [`ServerConfig`] is built in code or deserialized from JSON. It is passed
//! to [`Server::new`](crate::server::Server::new) and shared read-only with
//! every handler through [`Context::deployment`](crate::context::Context::deployment).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Configuration errors. These are raised at startup or registration time,
/// never while serving a request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a route must be registered with at least one prefix")]
    EmptyPrefixes,

    #[error("routes cannot be registered once the server has started")]
    AlreadyRunning,

    #[error("no listen prefixes configured")]
    NoListenPrefixes,

    #[error("invalid listen prefix {prefix:?}: {reason}")]
    InvalidListenPrefix { prefix: String, reason: String },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to build webhook validation client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Metadata about the running deployment, injected into handlers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Deployment {
    pub service_name: String,
    pub environment: String,
    pub metadata: HashMap<String, String>,
}

/// Settings for [`Server`](crate::server::Server).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use gatehouse::config::ServerConfig;
///
/// let config = ServerConfig::from_json(r#"{
///     "listen_prefixes": ["http://127.0.0.1:8080/"],
///     "retry_delay_ms": 250,
///     "deployment": { "service_name": "orders", "environment": "staging" }
/// }"#).unwrap();
///
/// assert_eq!(config.retry_delay(), Duration::from_millis(250));
/// assert_eq!(config.max_consecutive_failures, 10);
/// assert_eq!(config.listen_addrs().unwrap(), vec!["127.0.0.1:8080".to_string()]);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `scheme://host:port/` prefixes to listen on. Hosts `+` and `*` bind every interface.
    pub listen_prefixes: Vec<String>,
    /// Consecutive bind/accept failures tolerated before giving up for good.
    pub max_consecutive_failures: u32,
    pub retry_delay_ms: u64,
    /// Delay before the webhook validation callback is issued.
    pub webhook_validation_delay_ms: u64,
    /// Largest request (head plus body) buffered before answering `413`.
    pub max_request_size: usize,
    pub deployment: Deployment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_prefixes: Vec::new(),
            max_consecutive_failures: 10,
            retry_delay_ms: 1_000,
            webhook_validation_delay_ms: 1_000,
            max_request_size: 8 * 1024 * 1024,
            deployment: Deployment::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a config with default settings listening on `prefixes`.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            listen_prefixes: prefixes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Deserializes a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets how many listener failures in a row end the server.
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Sets the pause between listener restarts. Millisecond precision;
    /// anything longer than `u64::MAX` milliseconds is clamped.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = millis(delay);
        self
    }

    /// Sets how long the webhook callback waits after the handshake answer.
    #[must_use]
    pub fn with_webhook_validation_delay(mut self, delay: Duration) -> Self {
        self.webhook_validation_delay_ms = millis(delay);
        self
    }

    #[must_use]
    pub fn with_max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    #[must_use]
    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployment = deployment;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn webhook_validation_delay(&self) -> Duration {
        Duration::from_millis(self.webhook_validation_delay_ms)
    }

    /// Resolves the listen prefixes into distinct `host:port` bind addresses.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoListenPrefixes`] when the list is empty and
    /// [`ConfigError::InvalidListenPrefix`] for anything that is not an
    /// `http://host:port/` URL.
    pub fn listen_addrs(&self) -> Result<Vec<String>, ConfigError> {
        if self.listen_prefixes.is_empty() {
            return Err(ConfigError::NoListenPrefixes);
        }

        let mut addrs: Vec<String> = Vec::with_capacity(self.listen_prefixes.len());
        for prefix in &self.listen_prefixes {
            let addr = parse_listen_prefix(prefix)?;
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn parse_listen_prefix(prefix: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidListenPrefix {
        prefix: prefix.to_owned(),
        reason: reason.to_owned(),
    };

    let normalized = prefix
        .trim()
        .replacen("://+", "://0.0.0.0", 1)
        .replacen("://*", "://0.0.0.0", 1);
    let url = Url::parse(&normalized).map_err(|e| invalid(&e.to_string()))?;

    if url.scheme() != "http" {
        return Err(invalid("only http:// prefixes are supported"));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port"))?;

    Ok(format!("{host}:{port}"))
}
