//! CloudEvents webhook abuse-protection handshake.
//!
//! A sender that wants to deliver events to us first sends an `OPTIONS`
//! request naming a callback URL and its origin. We answer `200 OK` right
//! away and, after a short delay, confirm ownership by calling the callback
//! with the origin we allow and the rate we accept.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ConfigError;
use crate::http::{Method, Request};

pub const REQUEST_CALLBACK_HEADER: &str = "WebHook-Request-Callback";
pub const REQUEST_ORIGIN_HEADER: &str = "WebHook-Request-Origin";
pub const ALLOWED_ORIGIN_HEADER: &str = "WebHook-Allowed-Origin";
pub const ALLOWED_RATE_HEADER: &str = "WebHook-Allowed-Rate";

/// What an `OPTIONS` request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Neither webhook header is present: a standard CORS preflight.
    NotRequested,
    /// Only one of the two headers is present.
    Incomplete,
    /// Both headers are present.
    Requested { callback: String, origin: String },
}

impl Handshake {
    /// Classifies `request`. Anything other than `OPTIONS` is `NotRequested`.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatehouse::http::Request;
    /// use gatehouse::security::Handshake;
    ///
    /// let raw = b"OPTIONS /events HTTP/1.1\r\n\
    ///     webhook-request-callback: https://sender.example/validate?id=1\r\n\
    ///     WEBHOOK-REQUEST-ORIGIN: sender.example\r\n\r\n";
    /// let (request, _) = Request::parse(raw).unwrap();
    ///
    /// assert_eq!(
    ///     Handshake::inspect(&request),
    ///     Handshake::Requested {
    ///         callback: "https://sender.example/validate?id=1".into(),
    ///         origin: "sender.example".into(),
    ///     }
    /// );
    /// ```
    pub fn inspect(request: &Request) -> Self {
        if request.method() != &Method::Options {
            return Self::NotRequested;
        }

        let headers = request.headers();
        match (
            headers.get(REQUEST_CALLBACK_HEADER),
            headers.get(REQUEST_ORIGIN_HEADER),
        ) {
            (Some(callback), Some(origin)) => Self::Requested {
                callback: callback.trim().to_owned(),
                origin: origin.trim().to_owned(),
            },
            (None, None) => Self::NotRequested,
            _ => Self::Incomplete,
        }
    }
}

/// Issues the delayed validation callback.
///
/// The client accepts any certificate and TLS 1.0 or newer: senders'
/// validation endpoints are not expected to present trusted certificates.
#[derive(Debug, Clone)]
pub struct WebhookValidator {
    client: reqwest::Client,
    delay: Duration,
}

impl WebhookValidator {
    /// # Errors
    ///
    /// [`ConfigError::HttpClient`] if the HTTP client cannot be built.
    pub fn new(delay: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_0)
            .build()?;
        Ok(Self { client, delay })
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Fires the validation call after the configured delay on its own task.
    ///
    /// Failures are logged and never retried.
    pub fn schedule(&self, callback: String, origin: String) -> JoinHandle<()> {
        let validator = self.clone();
        debug!(callback = %callback, origin = %origin, delay = ?self.delay, "webhook validation scheduled");

        tokio::spawn(async move {
            tokio::time::sleep(validator.delay).await;
            match validator.validate(&callback, &origin).await {
                Ok(status) if status.is_success() => {
                    info!(callback = %callback, status = %status, "webhook validation accepted");
                }
                Ok(status) => {
                    error!(callback = %callback, status = %status, "webhook validation rejected");
                }
                Err(e) => {
                    error!(callback = %callback, error = %e, "webhook validation call failed");
                }
            }
        })
    }

    /// Performs the validation `GET` immediately.
    pub async fn validate(
        &self,
        callback: &str,
        origin: &str,
    ) -> Result<reqwest::StatusCode, reqwest::Error> {
        let response = self
            .client
            .get(callback)
            .header(ALLOWED_ORIGIN_HEADER, origin)
            .header(ALLOWED_RATE_HEADER, "*")
            .send()
            .await?;
        Ok(response.status())
    }
}
