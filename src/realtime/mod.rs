//! Protocol upgrade gate. Decides whether a routed request is served as
//! plain HTTP or upgraded to a WebSocket, and runs the WebSocket session.
//!
//! ```text
//!             ┌─ no upgrade ─┬─ HttpOnly / Both ──────► HTTP handler
//! request ────┤              └─ WebSocketOnly ─────────► 400
//!             └─ upgrade ────┬─ HttpOnly ──────────────► 400
//!                            └─ WebSocketOnly / Both ─► 101 handshake ─┬─ capable ─► WebSocket handler
//!                                                                      └─ not ─────► close 1011
//! ```
//!
//! Framing after the handshake is delegated to `tokio-tungstenite`.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::envelope::ResponseEnvelope;
use crate::handler::{Capabilities, Handler};
use crate::http::{Request, Response, StatusCode};
use crate::router::UpgradePolicy;
use crate::security::CorsPolicy;
use crate::server::Connection;

mod socket;

pub use socket::{SocketState, WebSocket};
pub use tungstenite::Message;
pub use tungstenite::protocol::frame::coding::CloseCode;

pub const ONLY_HTTP: &str = "Only HTTP requests are accepted";
pub const ONLY_WEBSOCKET: &str = "Only WebSocket requests are accepted";

/// Errors raised while upgrading or using a WebSocket.
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("WebSocket is closed")]
    Closed,

    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] tungstenite::Error),
}

/// How the client wants the connection served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    PlainHttp,
    WebSocketRequested,
}

impl Protocol {
    pub fn of(request: &Request) -> Self {
        if request.is_websocket_upgrade() {
            Self::WebSocketRequested
        } else {
            Self::PlainHttp
        }
    }
}

/// The gate's verdict for one routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Serve through the handler's HTTP method.
    Http,
    /// Complete the handshake. When `capable` is false the socket is closed
    /// with [`CloseCode::Error`] right after the handshake.
    Upgrade { capable: bool },
    /// Answer `400 Bad Request` with the given detail.
    Reject(&'static str),
}

/// Applies the route's upgrade policy to the requested protocol.
///
/// # Examples
///
/// ```
/// use gatehouse::handler::Capabilities;
/// use gatehouse::realtime::{decide, Gate, Protocol, ONLY_WEBSOCKET};
/// use gatehouse::router::UpgradePolicy;
///
/// assert_eq!(
///     decide(Protocol::PlainHttp, UpgradePolicy::WebSocketOnly, Capabilities::WebSocket),
///     Gate::Reject(ONLY_WEBSOCKET)
/// );
/// assert_eq!(
///     decide(Protocol::WebSocketRequested, UpgradePolicy::Both, Capabilities::Http),
///     Gate::Upgrade { capable: false }
/// );
/// ```
pub fn decide(protocol: Protocol, policy: UpgradePolicy, capabilities: Capabilities) -> Gate {
    match (protocol, policy) {
        (Protocol::WebSocketRequested, UpgradePolicy::HttpOnly) => Gate::Reject(ONLY_HTTP),
        (Protocol::WebSocketRequested, _) => Gate::Upgrade {
            capable: capabilities.websocket(),
        },
        (Protocol::PlainHttp, UpgradePolicy::WebSocketOnly) => Gate::Reject(ONLY_WEBSOCKET),
        (Protocol::PlainHttp, _) => Gate::Http,
    }
}

/// Writes the `101 Switching Protocols` answer for `request`.
async fn handshake(
    conn: &mut Connection,
    request: &Request,
    cors: &CorsPolicy,
) -> Result<(), WebSocketError> {
    let key = request
        .headers()
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(WebSocketError::MissingKey)?;

    let mut headers = crate::http::Headers::new();
    headers.insert("Upgrade", "websocket");
    headers.insert("Connection", "Upgrade");
    headers.insert("Sec-WebSocket-Accept", derive_accept_key(key.as_bytes()));
    cors.apply(&mut headers);

    let mut response = Response::new(StatusCode::SwitchingProtocols);
    for (name, value) in headers.iter() {
        response.add_header(name, value);
    }
    conn.write_all(&response.head_bytes(None)).await?;
    conn.flush().await?;
    Ok(())
}

/// Runs the WebSocket branch for one connection to completion.
///
/// Spawned on its own task by the dispatcher, so the per-connection task
/// does not wait for the socket's lifetime.
pub(crate) async fn serve_upgrade(
    mut conn: Connection,
    ctx: Context,
    mut handler: Box<dyn Handler>,
    capable: bool,
    cors: CorsPolicy,
) {
    let peer = conn.peer_addr();
    let path = ctx.request().path().to_owned();

    if let Err(e) = handshake(&mut conn, ctx.request(), &cors).await {
        warn!(peer = %peer, path = %path, error = %e, "WebSocket handshake failed");
        if matches!(e, WebSocketError::MissingKey) {
            let envelope = ResponseEnvelope::failure(StatusCode::BadRequest, e.to_string());
            if let Err(e) = conn.write_envelope(envelope, &cors).await {
                debug!(peer = %peer, error = %e, "failed to write handshake rejection");
            }
        }
        if let Err(e) = conn.close().await {
            debug!(peer = %peer, error = %e, "failed to close connection");
        }
        return;
    }

    let mut socket = WebSocket::upgrade(conn).await;
    debug!(peer = %peer, path = %path, "WebSocket upgraded");

    if capable {
        let outcome = AssertUnwindSafe(handler.handle_websocket(ctx, &mut socket))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => debug!(peer = %peer, path = %path, "WebSocket handler finished"),
            Ok(Err(e)) => error!(peer = %peer, path = %path, error = %e, "WebSocket handler failed"),
            Err(_) => error!(peer = %peer, path = %path, "WebSocket handler panicked"),
        }
    } else {
        error!(
            path = %path,
            "route accepts WebSocket upgrades but its handler has no WebSocket capability"
        );
        if let Err(e) = socket
            .close(CloseCode::Error, "Handler does not support WebSocket")
            .await
        {
            debug!(peer = %peer, error = %e, "failed to send internal-error close frame");
        }
    }

    if socket.is_open() {
        if let Err(e) = socket.close(CloseCode::Normal, "").await {
            debug!(peer = %peer, error = %e, "failed to send normal close frame");
        }
    }
}
