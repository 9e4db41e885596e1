//! One accepted client connection: request reading and response writing.

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::envelope::{Body, InternalErrorCode, ResponseEnvelope};
use crate::http::request::{Request, RequestError};
use crate::http::{Response, StatusCode};
use crate::security::CorsPolicy;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Byte transport a connection runs over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Result of reading a request off the wire.
#[derive(Debug)]
pub(crate) enum Incoming {
    Request(Request),
    /// The peer closed the connection before sending a complete request.
    Closed,
    TooLarge,
    Malformed(RequestError),
}

/// A client connection.
///
/// The output side is shut down at most once, however many times
/// [`close`](Self::close) is called.
pub struct Connection {
    io: BoxedIo,
    peer: SocketAddr,
    buf: BytesMut,
    closed: bool,
}

impl Connection {
    pub(crate) fn new(io: BoxedIo, peer: SocketAddr) -> Self {
        Self {
            io,
            peer,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads one complete request, body included.
    pub(crate) async fn read_request(&mut self, max_size: usize) -> io::Result<Incoming> {
        loop {
            let bytes_read = self.io.read_buf(&mut self.buf).await?;

            if bytes_read == 0 {
                return Ok(Incoming::Closed);
            }

            if self.buf.len() > max_size {
                return Ok(Incoming::TooLarge);
            }

            let (request, body_offset) = match Request::parse(&self.buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => continue,
                Err(e) => return Ok(Incoming::Malformed(e)),
            };

            // Wait for the full body to arrive if Content-Length is set.
            let Some(total_needed) =
                body_offset.checked_add(request.content_length().unwrap_or(0))
            else {
                return Ok(Incoming::TooLarge);
            };
            if total_needed > max_size {
                return Ok(Incoming::TooLarge);
            }
            if self.buf.len() < total_needed {
                continue;
            }

            let _ = self.buf.split_to(total_needed);
            return Ok(Incoming::Request(request));
        }
    }

    /// Writes raw bytes. Handlers answering with a bypass envelope use this
    /// to produce their own response.
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        self.io.write_all(bytes).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.io.flush().await
    }

    /// Shuts the output side down. Only the first call has any effect.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io.shutdown().await
    }

    /// Like [`close`](Self::close), logging instead of returning the error.
    pub(crate) async fn close_quietly(&mut self) {
        if let Err(e) = self.close().await {
            debug!(peer = %self.peer, error = %e, "failed to close connection");
        }
    }

    /// Serializes `envelope` onto the wire with the server's CORS headers.
    ///
    /// A bypass envelope writes nothing. A stream body of zero length is
    /// replaced by a `500` carrying [`InternalErrorCode::ResponseStreamLength`].
    pub(crate) async fn write_envelope(
        &mut self,
        envelope: ResponseEnvelope,
        cors: &CorsPolicy,
    ) -> io::Result<()> {
        let empty_stream = matches!(envelope.body(), Body::Stream { length: 0, .. });
        let envelope = if empty_stream {
            error!(peer = %self.peer, "handler returned a stream body with non-positive length");
            ResponseEnvelope::internal_error(
                InternalErrorCode::ResponseStreamLength,
                "Response stream length must be positive.",
            )
        } else {
            envelope
        };

        let parts = envelope.into_parts();
        if parts.bypass {
            return Ok(());
        }

        let mut headers = parts.headers;
        cors.apply(&mut headers);
        headers.set("Connection", "close");

        let status = match &parts.redirect {
            Some(target) => {
                headers.set("Location", target.as_str());
                if parts.status.is_redirection() {
                    parts.status
                } else {
                    StatusCode::Found
                }
            }
            None => parts.status,
        };

        if let Some(content_type) = parts.content_type {
            headers.set("Content-Type", content_type);
        }

        let mut response = Response::new(status);
        for (name, value) in headers.iter() {
            response.add_header(name, value);
        }

        debug!(peer = %self.peer, status = %status, "writing response");

        match parts.body {
            _ if parts.redirect.is_some() => {
                self.write_all(&response.into_bytes()).await?;
            }
            Body::Empty => {
                self.write_all(&response.into_bytes()).await?;
            }
            Body::Text(text) => {
                self.write_all(&response.body(text).into_bytes()).await?;
            }
            Body::Stream { reader, length } => {
                self.write_all(&response.head_bytes(Some(length))).await?;
                let copied = tokio::io::copy(&mut reader.take(length), &mut self.io).await?;
                if copied < length {
                    error!(
                        peer = %self.peer,
                        expected = length,
                        copied,
                        code = InternalErrorCode::ResponseStreamRead.as_str(),
                        "response stream ended early"
                    );
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "response stream ended before its declared length",
                    ));
                }
            }
        }

        self.io.flush().await
    }

    /// Gives up the transport for a protocol upgrade, with any bytes read
    /// past the request.
    pub(crate) fn into_upgrade_parts(self) -> (BoxedIo, BytesMut) {
        (self.io, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{DuplexStream, duplex};

    fn pair() -> (Connection, DuplexStream) {
        let (server, client) = duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        (Connection::new(Box::new(server), peer), client)
    }

    async fn written(mut conn: Connection, mut client: DuplexStream) -> String {
        conn.close().await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn reads_request_with_body() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel")
            .await
            .unwrap();
        let reader = tokio::spawn(async move {
            let incoming = conn.read_request(1024).await.unwrap();
            (conn, incoming)
        });
        tokio::task::yield_now().await;
        client.write_all(b"lo").await.unwrap();

        let (_conn, incoming) = reader.await.unwrap();
        match incoming {
            Incoming::Request(req) => assert_eq!(req.body().as_ref(), b"hello"),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_request() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 500\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(conn.read_request(64).await.unwrap(), Incoming::TooLarge));
    }

    #[tokio::test]
    async fn overflowing_content_length_is_too_large() {
        let (mut conn, mut client) = pair();
        let raw = format!("POST /x HTTP/1.1\r\nContent-Length: {}\r\n\r\n", usize::MAX);
        client.write_all(raw.as_bytes()).await.unwrap();
        assert!(matches!(
            conn.read_request(1024).await.unwrap(),
            Incoming::TooLarge
        ));
    }

    #[tokio::test]
    async fn peer_hangup() {
        let (mut conn, client) = pair();
        drop(client);
        assert!(matches!(conn.read_request(64).await.unwrap(), Incoming::Closed));
    }

    #[tokio::test]
    async fn text_envelope_with_cors() {
        let (mut conn, client) = pair();
        let env = ResponseEnvelope::text(StatusCode::Ok, "héllo")
            .with_header("Access-Control-Allow-Origin", "https://handler.example");
        conn.write_envelope(env, &CorsPolicy::new()).await.unwrap();

        let out = written(conn, client).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(!out.contains("handler.example"));
        assert!(out.contains("Content-Length: 6\r\n"));
        assert!(out.ends_with("héllo"));
    }

    #[tokio::test]
    async fn redirect_envelope() {
        let (mut conn, client) = pair();
        conn.write_envelope(ResponseEnvelope::redirect("/login"), &CorsPolicy::new())
            .await
            .unwrap();
        let out = written(conn, client).await;
        assert!(out.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(out.contains("Location: /login\r\n"));
        assert!(out.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn stream_envelope_is_copied_with_length() {
        let (mut conn, client) = pair();
        let env = ResponseEnvelope::stream(StatusCode::Ok, Box::new(&b"0123456789"[..]), 4)
            .with_content_type("application/octet-stream");
        conn.write_envelope(env, &CorsPolicy::new()).await.unwrap();
        let out = written(conn, client).await;
        assert!(out.contains("Content-Type: application/octet-stream\r\n"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(out.ends_with("\r\n\r\n0123"));
    }

    #[tokio::test]
    async fn zero_length_stream_is_a_coded_500() {
        let (mut conn, client) = pair();
        let env = ResponseEnvelope::stream(StatusCode::Ok, Box::new(&b""[..]), 0);
        conn.write_envelope(env, &CorsPolicy::new()).await.unwrap();
        let out = written(conn, client).await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("RESPONSE_STREAM_LENGTH"));
    }

    #[tokio::test]
    async fn short_stream_is_an_error() {
        let (mut conn, _client) = pair();
        let env = ResponseEnvelope::stream(StatusCode::Ok, Box::new(&b"ab"[..]), 10);
        let err = conn.write_envelope(env, &CorsPolicy::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn bypass_writes_nothing() {
        let (mut conn, client) = pair();
        conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        conn.write_envelope(ResponseEnvelope::bypass(), &CorsPolicy::new())
            .await
            .unwrap();
        assert_eq!(written(conn, client).await, "HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut conn, _client) = pair();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        conn.close().await.unwrap();
        assert!(conn.write_all(b"late").await.is_err());
    }
}
