//! Server-wide CORS policy.
//!
//! The server's policy always wins: any `Access-Control-Allow-Origin` a
//! handler sets is replaced before the response is written.

use crate::envelope::ResponseEnvelope;
use crate::http::{Headers, StatusCode};

pub const ALLOW_ORIGIN: &str = "Access-Control-Allow-Origin";
pub const EXPOSE_HEADERS: &str = "Access-Control-Expose-Headers";
pub const ALLOW_HEADERS: &str = "Access-Control-Allow-Headers";
pub const ALLOW_CREDENTIALS: &str = "Access-Control-Allow-Credentials";
pub const ALLOW_METHODS: &str = "Access-Control-Allow-Methods";
pub const MAX_AGE: &str = "Access-Control-Max-Age";

/// Permissive CORS headers attached to every response, plus the answer to a
/// standard (non-webhook) `OPTIONS` preflight.
///
/// | Header                              | Value                            |
/// |-------------------------------------|----------------------------------|
/// | `Access-Control-Allow-Origin`       | `*`                              |
/// | `Access-Control-Expose-Headers`     | `*`                              |
/// | `Access-Control-Allow-Headers`      | `*` (preflight only)             |
/// | `Access-Control-Allow-Credentials`  | `true` (preflight only)          |
/// | `Access-Control-Allow-Methods`      | `GET, POST, PUT, DELETE, PATCH` (preflight only) |
/// | `Access-Control-Max-Age`            | `-1` (preflight only)            |
///
/// # Examples
///
/// ```
/// use gatehouse::http::Headers;
/// use gatehouse::security::CorsPolicy;
///
/// let mut headers = Headers::new();
/// headers.insert("Access-Control-Allow-Origin", "https://handler.example");
/// CorsPolicy::new().apply(&mut headers);
///
/// assert_eq!(headers.get("access-control-allow-origin"), Some("*"));
/// assert_eq!(headers.get_all("access-control-allow-origin").count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origin: String,
    allowed_methods: Vec<String>,
    max_age: i64,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsPolicy {
    pub fn new() -> Self {
        Self {
            allowed_origin: "*".to_string(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "PATCH"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_age: -1,
        }
    }

    /// Writes the always-present CORS headers into `headers`, replacing any
    /// origin or expose-headers value set by a handler.
    pub fn apply(&self, headers: &mut Headers) {
        headers.set(ALLOW_ORIGIN, self.allowed_origin.as_str());
        headers.set(EXPOSE_HEADERS, "*");
    }

    /// The `200 OK` answer to a standard preflight request.
    pub fn preflight(&self) -> ResponseEnvelope {
        ResponseEnvelope::new(StatusCode::Ok)
            .with_header(ALLOW_HEADERS, "*")
            .with_header(ALLOW_CREDENTIALS, "true")
            .with_header(ALLOW_METHODS, self.allowed_methods.join(", "))
            .with_header(MAX_AGE, self.max_age.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_adds_origin_and_expose() {
        let mut headers = Headers::new();
        headers.insert("X-Custom", "1");
        CorsPolicy::new().apply(&mut headers);
        assert_eq!(headers.get(ALLOW_ORIGIN), Some("*"));
        assert_eq!(headers.get(EXPOSE_HEADERS), Some("*"));
        assert_eq!(headers.get("x-custom"), Some("1"));
    }

    #[test]
    fn preflight_headers() {
        let env = CorsPolicy::new().preflight();
        assert_eq!(env.status(), StatusCode::Ok);
        let h = env.headers();
        assert_eq!(h.get(ALLOW_HEADERS), Some("*"));
        assert_eq!(h.get(ALLOW_CREDENTIALS), Some("true"));
        assert_eq!(h.get(ALLOW_METHODS), Some("GET, POST, PUT, DELETE, PATCH"));
        assert_eq!(h.get(MAX_AGE), Some("-1"));
    }
}
