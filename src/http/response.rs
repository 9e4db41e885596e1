//! HTTP/1.1 response serialization.
//!
//! [`Response`] is the wire-level message: a status line, headers and an
//! optional in-memory body. Streamed bodies are written by serializing only
//! the head with [`Response::head_bytes`] and copying the stream after it.

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use gatehouse::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Serializes the status line and headers, terminated by the blank line.
    ///
    /// `Content-Length` is written last when `content_length` is `Some`; a
    /// `101 Switching Protocols` head passes `None`.
    pub fn head_bytes(&self, content_length: Option<u64>) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        if let Some(len) = content_length {
            buf.put(format!("Content-Length: {len}\r\n").as_bytes());
        }

        buf.put(&b"\r\n"[..]);
        buf
    }

    /// Serializes the whole response, body included.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` when the body is
    /// non-empty and no content type was set.
    pub fn into_bytes(mut self) -> BytesMut {
        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let mut buf = self.head_bytes(Some(self.body.len() as u64));
        buf.put(self.body.as_slice());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok).body("pong");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(s.contains("Content-Length: 4\r\n"));
        assert!(s.ends_with("\r\n\r\npong"));
    }

    #[test]
    fn multi_valued_headers_are_repeated() {
        let r = Response::new(StatusCode::Ok)
            .header("Set-Cookie", "a=1")
            .header("Set-Cookie", "b=2");
        let s = to_string(r.into_bytes());
        assert!(s.contains("Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n"));
    }

    #[test]
    fn head_without_length() {
        let r = Response::new(StatusCode::SwitchingProtocols).header("Upgrade", "websocket");
        let s = to_string(r.head_bytes(None));
        assert_eq!(s, "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n");
    }

    #[test]
    fn empty_body_has_zero_length_and_no_type() {
        let s = to_string(Response::new(StatusCode::NoContent).into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }
}
