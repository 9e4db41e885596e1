//! Handler capability model.
//!
//! A route resolves to a [`HandlerFactory`], which creates a fresh
//! [`Handler`] for every matched request. Each handler declares the
//! [`Capabilities`] it supports; the upgrade gate dispatches on that declared
//! set rather than on the handler's concrete type.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::context::Context;
use crate::envelope::ResponseEnvelope;
use crate::realtime::{WebSocket, WebSocketError};
use crate::server::Connection;

/// Boxed future returned by handler methods.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send + 'a>>;

/// Produces a new handler instance per matched request.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync + 'static>;

/// Failures a handler reports. The server answers HTTP requests that end in
/// one of these with `500 Internal Server Error`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler does not support {0} requests")]
    Unsupported(&'static str),

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] WebSocketError),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The request kinds a handler can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capabilities {
    Http,
    WebSocket,
    HttpAndWebSocket,
}

impl Capabilities {
    pub fn http(self) -> bool {
        matches!(self, Self::Http | Self::HttpAndWebSocket)
    }

    pub fn websocket(self) -> bool {
        matches!(self, Self::WebSocket | Self::HttpAndWebSocket)
    }
}

/// A per-request handler.
///
/// Implement the method(s) matching [`capabilities`](Handler::capabilities);
/// the defaults fail with [`HandlerError::Unsupported`].
///
/// # Examples
///
/// ```rust,no_run
/// use gatehouse::context::Context;
/// use gatehouse::envelope::ResponseEnvelope;
/// use gatehouse::handler::{Capabilities, Handler, HandlerFuture};
/// use gatehouse::http::StatusCode;
/// use gatehouse::server::Connection;
///
/// struct Orders;
///
/// impl Handler for Orders {
///     fn capabilities(&self) -> Capabilities {
///         Capabilities::Http
///     }
///
///     fn handle_http<'a>(
///         &'a mut self,
///         ctx: Context,
///         _conn: &'a mut Connection,
///     ) -> HandlerFuture<'a, ResponseEnvelope> {
///         Box::pin(async move {
///             let user = ctx.restful_param("users").unwrap_or("unknown").to_owned();
///             Ok(ResponseEnvelope::success(StatusCode::Ok, user))
///         })
///     }
/// }
/// ```
pub trait Handler: Send {
    /// The request kinds this handler serves.
    fn capabilities(&self) -> Capabilities;

    /// Serves a plain HTTP request.
    ///
    /// `conn` is available for handlers that write the response themselves;
    /// they must then return [`ResponseEnvelope::bypass`].
    fn handle_http<'a>(
        &'a mut self,
        ctx: Context,
        conn: &'a mut Connection,
    ) -> HandlerFuture<'a, ResponseEnvelope> {
        let _ = (ctx, conn);
        Box::pin(async { Err(HandlerError::Unsupported("HTTP")) })
    }

    /// Serves an upgraded WebSocket. The socket is closed with a normal
    /// closure frame after this returns, unless the handler closed it already.
    fn handle_websocket<'a>(
        &'a mut self,
        ctx: Context,
        socket: &'a mut WebSocket,
    ) -> HandlerFuture<'a, ()> {
        let _ = (ctx, socket);
        Box::pin(async { Err(HandlerError::Unsupported("WebSocket")) })
    }
}

/// Wraps a handler constructor into a [`HandlerFactory`].
pub fn factory<H, F>(make: F) -> HandlerFactory
where
    H: Handler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn Handler>)
}

/// Builds an HTTP-only [`HandlerFactory`] from an async function.
///
/// # Examples
///
/// ```rust
/// use gatehouse::envelope::ResponseEnvelope;
/// use gatehouse::handler;
/// use gatehouse::http::StatusCode;
///
/// let hello = handler::from_fn(|ctx| async move {
///     let name = ctx.query_param("name").unwrap_or("world").to_owned();
///     Ok(ResponseEnvelope::success(StatusCode::Ok, format!("hello {name}")))
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> HandlerFactory
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseEnvelope, HandlerError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move || {
        Box::new(FnHandler {
            f: Arc::clone(&f),
        }) as Box<dyn Handler>
    })
}

struct FnHandler<F> {
    f: Arc<F>,
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseEnvelope, HandlerError>> + Send + 'static,
{
    fn capabilities(&self) -> Capabilities {
        Capabilities::Http
    }

    fn handle_http<'a>(
        &'a mut self,
        ctx: Context,
        _conn: &'a mut Connection,
    ) -> HandlerFuture<'a, ResponseEnvelope> {
        Box::pin((self.f)(ctx))
    }
}
