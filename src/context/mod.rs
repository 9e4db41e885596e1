//! Per-request context: restful path captures, query parameters and the
//! injected deployment configuration.
//!
//! A [`RequestContext`] is derived from the raw request target and the
//! matched route prefix by a pure constructor, so it is built exactly once
//! per request and never mutated afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Request;
use crate::config::Deployment;

/// A string-to-string parameter map.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: HashMap<String, String>,
}

impl Parameters {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Looks up `key`.
    ///
    /// # Arguments
    ///
    /// * `key` - The segment name for restful params, or the query key.
    ///
    /// # Returns
    ///
    /// The value, or `None` if the key was never captured.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if no entries were captured.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over `(key, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Values derived from the request target and the matched route prefix.
///
/// # Examples
///
/// ```
/// use gatehouse::context::RequestContext;
///
/// let ctx = RequestContext::new("/users/42/orders?limit=5&bad", "/users/*/orders");
/// assert_eq!(ctx.restful_params().get("users"), Some("42"));
/// assert_eq!(ctx.query_params().get("limit"), Some("5"));
/// assert_eq!(ctx.query_params().get("bad"), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    restful_params: Parameters,
    query_params: Parameters,
}

impl RequestContext {
    /// Builds the context for `raw_path` (query string included) matched by
    /// `matched_prefix`.
    ///
    /// Every `*` segment of the prefix captures the raw segment at the same
    /// index, keyed by the raw segment just before it. Query parameters are
    /// read from the whole raw path independently of the prefix.
    pub fn new(raw_path: &str, matched_prefix: &str) -> Self {
        Self {
            restful_params: capture_restful_params(raw_path, matched_prefix),
            query_params: parse_query_params(raw_path),
        }
    }

    pub fn restful_params(&self) -> &Parameters {
        &self.restful_params
    }

    pub fn query_params(&self) -> &Parameters {
        &self.query_params
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn capture_restful_params(raw_path: &str, matched_prefix: &str) -> Parameters {
    let raw = segments(raw_path);
    let mut params = Parameters::new();

    for (index, segment) in segments(matched_prefix).into_iter().enumerate() {
        // A leading `*` has no name to be stored under.
        if segment != "*" || index == 0 {
            continue;
        }
        let (Some(name), Some(value)) = (raw.get(index - 1), raw.get(index)) else {
            continue;
        };
        let value = value.split_once('?').map_or(*value, |(v, _)| v);
        params.insert(*name, value);
    }

    params
}

/// Splits on the first `?`, then `&`, then `=`. Pairs without exactly one
/// `=` are dropped.
fn parse_query_params(raw_path: &str) -> Parameters {
    let mut params = Parameters::new();
    let Some((_, query)) = raw_path.split_once('?') else {
        return params;
    };

    for pair in query.split('&') {
        let mut parts = pair.split('=');
        if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
            params.insert(key, value);
        }
    }

    params
}

/// Everything a handler gets to know about the request it is serving.
///
/// Owned by the handler instance for the lifetime of one request.
#[derive(Debug)]
pub struct Context {
    request: Request,
    matched_prefix: String,
    params: RequestContext,
    deployment: Arc<Deployment>,
}

impl Context {
    /// Builds the context for `request` matched by `matched_prefix`.
    pub fn new(request: Request, matched_prefix: impl Into<String>, deployment: Arc<Deployment>) -> Self {
        let matched_prefix = matched_prefix.into();
        let params = RequestContext::new(request.target(), &matched_prefix);
        Self {
            request,
            matched_prefix,
            params,
            deployment,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The route pattern that selected this request's handler.
    pub fn matched_prefix(&self) -> &str {
        &self.matched_prefix
    }

    pub fn params(&self) -> &RequestContext {
        &self.params
    }

    /// Shorthand for a restful capture.
    pub fn restful_param(&self, key: &str) -> Option<&str> {
        self.params.restful_params().get(key)
    }

    /// Shorthand for a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.query_params().get(key)
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}
