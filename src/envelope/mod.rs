//! The uniform response envelope every handler produces.
//!
//! A [`ResponseEnvelope`] describes *what* to send; the server decides *how*
//! to put it on the wire (CORS headers, `Content-Length`, redirects, stream
//! copying). It also carries the standard JSON success and failure shapes:
//!
//! ```text
//! {"result":"success","message":"pong"}
//! {"result":"failure","message":"Not Found. No route for /nope"}
//! ```

use std::fmt;

use serde_json::{Map, Value};
use tokio::io::AsyncRead;

use crate::http::{Headers, StatusCode};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A boxed async byte source for streamed bodies.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Response body variants.
pub enum Body {
    Empty,
    /// UTF-8 text, written with its byte length.
    Text(String),
    /// A byte stream copied through with an explicit length. A zero length is
    /// rejected by the server with a `500`.
    Stream { reader: BoxedReader, length: u64 },
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Body::Stream { length, .. } => f
                .debug_struct("Stream")
                .field("length", length)
                .finish_non_exhaustive(),
        }
    }
}

/// Internal error codes carried in the `code` field of server-generated
/// `500` envelopes, so the cause of a failure is distinguishable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalErrorCode {
    /// A stream body was returned with a non-positive length.
    ResponseStreamLength,
    /// The handler returned an error.
    HandlerFailed,
    /// The handler panicked.
    HandlerPanicked,
    /// Reading a stream body failed after the head was written.
    ResponseStreamRead,
}

impl InternalErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResponseStreamLength => "RESPONSE_STREAM_LENGTH",
            Self::HandlerFailed => "HANDLER_FAILED",
            Self::HandlerPanicked => "HANDLER_PANICKED",
            Self::ResponseStreamRead => "RESPONSE_STREAM_READ",
        }
    }
}

/// The result of handling one request.
///
/// Envelopes are built once and not mutated afterwards; the builder methods
/// consume `self`. A redirect envelope never carries a body.
///
/// # Examples
///
/// ```
/// use gatehouse::envelope::ResponseEnvelope;
/// use gatehouse::http::StatusCode;
///
/// let envelope = ResponseEnvelope::text(StatusCode::Created, "made it")
///     .with_header("X-Trace", "abc")
///     .with_header("X-Trace", "def");
///
/// assert_eq!(envelope.status(), StatusCode::Created);
/// assert_eq!(envelope.headers().get_all("x-trace").count(), 2);
/// assert!(!envelope.is_bypass());
/// ```
#[derive(Debug)]
pub struct ResponseEnvelope {
    status: StatusCode,
    headers: Headers,
    body: Body,
    content_type: Option<String>,
    redirect: Option<String>,
    bypass: bool,
}

impl ResponseEnvelope {
    /// An envelope with an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            content_type: None,
            redirect: None,
            bypass: false,
        }
    }

    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self {
            body: Body::Text(text.into()),
            ..Self::new(status)
        }
    }

    /// A streamed body of exactly `length` bytes.
    pub fn stream(status: StatusCode, reader: BoxedReader, length: u64) -> Self {
        Self {
            body: Body::Stream { reader, length },
            ..Self::new(status)
        }
    }

    /// A `302 Found` redirect to `target`.
    pub fn redirect(target: impl Into<String>) -> Self {
        Self::redirect_with(StatusCode::Found, target)
    }

    /// A redirect with an explicit status; non-3xx statuses are written as `302`.
    pub fn redirect_with(status: StatusCode, target: impl Into<String>) -> Self {
        Self {
            redirect: Some(target.into()),
            ..Self::new(status)
        }
    }

    /// Marks the response as already written by the handler.
    pub fn bypass() -> Self {
        Self {
            bypass: true,
            ..Self::new(StatusCode::Ok)
        }
    }

    /// `{"result":"success","message":<message>}`.
    pub fn success(status: StatusCode, message: impl Into<String>) -> Self {
        Self::success_with(status, message, Map::new())
    }

    /// A success envelope with extra top-level fields merged in. `result` and
    /// `message` always win over fields of the same name.
    pub fn success_with(
        status: StatusCode,
        message: impl Into<String>,
        mut fields: Map<String, Value>,
    ) -> Self {
        fields.insert("result".into(), Value::from("success"));
        fields.insert("message".into(), Value::from(message.into()));
        Self::json(status, Value::Object(fields))
    }

    /// `{"result":"failure","message":"<Category>. <detail>"}`.
    pub fn failure(status: StatusCode, detail: impl AsRef<str>) -> Self {
        Self::failure_with(status, detail, Map::new())
    }

    /// A failure envelope tagged with an internal error code.
    pub fn internal_error(code: InternalErrorCode, detail: impl AsRef<str>) -> Self {
        let mut fields = Map::new();
        fields.insert("code".into(), Value::from(code.as_str()));
        Self::failure_with(StatusCode::InternalServerError, detail, fields)
    }

    pub fn failure_with(
        status: StatusCode,
        detail: impl AsRef<str>,
        mut fields: Map<String, Value>,
    ) -> Self {
        fields.insert("result".into(), Value::from("failure"));
        fields.insert(
            "message".into(),
            Value::from(failure_message(status, detail.as_ref())),
        );
        Self::json(status, Value::Object(fields))
    }

    fn json(status: StatusCode, value: Value) -> Self {
        Self::text(status, value.to_string()).with_content_type(JSON_CONTENT_TYPE)
    }

    /// Appends a header value; repeated names accumulate.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    pub(crate) fn into_parts(self) -> EnvelopeParts {
        EnvelopeParts {
            status: self.status,
            headers: self.headers,
            body: self.body,
            content_type: self.content_type,
            redirect: self.redirect,
            bypass: self.bypass,
        }
    }
}

/// Owned fields of an envelope, consumed by the wire writer.
pub(crate) struct EnvelopeParts {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Body,
    pub content_type: Option<String>,
    pub redirect: Option<String>,
    pub bypass: bool,
}

/// Formats `"<Category>. <detail>"`; `503` adds the retry hint.
pub fn failure_message(status: StatusCode, detail: &str) -> String {
    let mut message = format!("{}.", status.canonical_reason());
    if status == StatusCode::ServiceUnavailable {
        message.push_str(" Please retry later.");
    }
    if !detail.is_empty() {
        message.push(' ');
        message.push_str(detail);
    }
    message
}
