//! The upgraded WebSocket handle handed to handlers.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tracing::debug;

use super::{CloseCode, Message, WebSocketError};
use crate::server::{BoxedIo, Connection};

/// Lifecycle of a [`WebSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    /// A close frame was sent or received, or the transport failed.
    Closed,
}

/// An upgraded, bidirectional WebSocket channel.
///
/// Owned by the session task for the lifetime of the connection; handlers
/// borrow it. Whether it is still usable is tracked in the handle itself.
pub struct WebSocket {
    stream: WebSocketStream<BoxedIo>,
    peer: SocketAddr,
    state: SocketState,
}

impl WebSocket {
    /// Wraps a connection whose `101` answer has already been written.
    pub(crate) async fn upgrade(conn: Connection) -> Self {
        let peer = conn.peer_addr();
        let (io, leftover) = conn.into_upgrade_parts();
        let stream =
            WebSocketStream::from_partially_read(io, leftover.to_vec(), Role::Server, None).await;
        Self {
            stream,
            peer,
            state: SocketState::Open,
        }
    }

    /// Returns the address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Returns the socket's lifecycle state.
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Shorthand for `state() == SocketState::Open`.
    pub fn is_open(&self) -> bool {
        self.state == SocketState::Open
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::Closed`] once the socket is closed, or the transport error.
    pub async fn send(&mut self, message: Message) -> Result<(), WebSocketError> {
        if !self.is_open() {
            return Err(WebSocketError::Closed);
        }
        self.stream.send(message).await.map_err(|e| {
            self.state = SocketState::Closed;
            WebSocketError::from(e)
        })
    }

    /// Receives the next message, or `None` once the socket is closed.
    ///
    /// A close frame from the peer is returned once and answered
    /// automatically; the socket is closed afterwards.
    pub async fn recv(&mut self) -> Option<Result<Message, WebSocketError>> {
        if !self.is_open() {
            return None;
        }

        match self.stream.next().await {
            Some(Ok(Message::Close(frame))) => {
                self.state = SocketState::Closed;
                // Pushes out the queued close reply.
                if let Err(e) = self.stream.flush().await {
                    debug!(peer = %self.peer, error = %e, "failed to flush close reply");
                }
                Some(Ok(Message::Close(frame)))
            }
            Some(Ok(message)) => Some(Ok(message)),
            Some(Err(e)) => {
                self.state = SocketState::Closed;
                Some(Err(e.into()))
            }
            None => {
                self.state = SocketState::Closed;
                None
            }
        }
    }

    /// Sends a close frame with `code` and `reason`. Closing an already
    /// closed socket does nothing.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        if !self.is_open() {
            return Ok(());
        }
        self.state = SocketState::Closed;

        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        self.stream.close(Some(frame)).await?;
        Ok(())
    }
}
