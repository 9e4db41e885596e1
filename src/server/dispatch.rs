//! Per-connection request dispatch.
//!
//! Order of checks for every request:
//!
//! 1. `OPTIONS` without webhook headers: CORS preflight.
//! 2. `OPTIONS` with webhook headers: webhook handshake.
//! 3. Route resolution.
//! 4. On a miss, a path ending in `/ping` gets the liveness answer and
//!    anything else a `404`.
//! 5. Upgrade gate: HTTP handler, WebSocket session, or `400`.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, warn};

use super::connection::{BoxedIo, Connection, Incoming};
use crate::config::Deployment;
use crate::context::Context;
use crate::envelope::{InternalErrorCode, ResponseEnvelope};
use crate::handler::Handler;
use crate::http::{Method, Request, StatusCode};
use crate::realtime::{self, Gate, Protocol};
use crate::router::Router;
use crate::security::{CorsPolicy, Handshake, WebhookValidator};

/// Shared, read-only state every connection task dispatches against.
pub(crate) struct Dispatcher {
    router: Router,
    cors: CorsPolicy,
    webhook: WebhookValidator,
    deployment: Arc<Deployment>,
    max_request_size: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        router: Router,
        webhook: WebhookValidator,
        deployment: Arc<Deployment>,
        max_request_size: usize,
    ) -> Self {
        Self {
            router,
            cors: CorsPolicy::new(),
            webhook,
            deployment,
            max_request_size,
        }
    }

    /// Serves one accepted connection to completion.
    pub(crate) async fn serve(self: Arc<Self>, io: BoxedIo, peer: SocketAddr) {
        let mut conn = Connection::new(io, peer);
        debug!(peer = %peer, "connection accepted");

        let envelope = match conn.read_request(self.max_request_size).await {
            Ok(Incoming::Request(request)) => return self.dispatch(conn, request).await,
            Ok(Incoming::Closed) => {
                debug!(peer = %peer, "connection closed by peer");
                None
            }
            Ok(Incoming::TooLarge) => {
                warn!(peer = %peer, "request too large, sending 413");
                Some(ResponseEnvelope::failure(StatusCode::PayloadTooLarge, ""))
            }
            Ok(Incoming::Malformed(e)) => {
                warn!(peer = %peer, error = %e, "bad request, sending 400");
                Some(ResponseEnvelope::failure(StatusCode::BadRequest, e.to_string()))
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "failed to read request");
                None
            }
        };

        match envelope {
            Some(envelope) => self.respond(conn, envelope).await,
            None => conn.close_quietly().await,
        }
    }

    async fn dispatch(&self, conn: Connection, request: Request) {
        debug!(
            peer = %conn.peer_addr(),
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        if request.method() == &Method::Options {
            let envelope = self.options(&request);
            self.respond(conn, envelope).await;
        } else {
            self.routed(conn, request).await;
        }
    }

    fn options(&self, request: &Request) -> ResponseEnvelope {
        match Handshake::inspect(request) {
            Handshake::NotRequested => self.cors.preflight(),
            Handshake::Incomplete => {
                warn!(path = %request.path(), "webhook handshake with a missing header");
                ResponseEnvelope::failure(
                    StatusCode::BadRequest,
                    "Webhook handshake requires both WebHook-Request-Callback and WebHook-Request-Origin.",
                )
            }
            Handshake::Requested { callback, origin } => {
                self.webhook.schedule(callback, origin);
                ResponseEnvelope::new(StatusCode::Ok)
            }
        }
    }

    async fn routed(&self, mut conn: Connection, request: Request) {
        let path = request.path().to_owned();

        let Some(route) = self.router.resolve(&path) else {
            let envelope = if is_ping(&path) {
                ResponseEnvelope::success(StatusCode::Ok, "pong")
            } else {
                debug!(path = %path, "no route matched");
                ResponseEnvelope::failure(StatusCode::NotFound, format!("No route matches {path}"))
            };
            return self.respond(conn, envelope).await;
        };

        let prefix = route.prefix.to_owned();
        let policy = route.policy;
        let mut handler = (route.factory)();

        match realtime::decide(Protocol::of(&request), policy, handler.capabilities()) {
            Gate::Reject(reason) => {
                warn!(path = %path, prefix = %prefix, reason, "request rejected by upgrade policy");
                self.respond(conn, ResponseEnvelope::failure(StatusCode::BadRequest, reason))
                    .await;
            }
            Gate::Http => {
                let ctx = Context::new(request, prefix, Arc::clone(&self.deployment));
                let envelope = invoke_http(handler.as_mut(), ctx, &mut conn, &path).await;
                self.respond(conn, envelope).await;
            }
            Gate::Upgrade { capable } => {
                let ctx = Context::new(request, prefix, Arc::clone(&self.deployment));
                tokio::spawn(realtime::serve_upgrade(
                    conn,
                    ctx,
                    handler,
                    capable,
                    self.cors.clone(),
                ));
            }
        }
    }

    /// Writes `envelope` and closes the connection.
    async fn respond(&self, mut conn: Connection, envelope: ResponseEnvelope) {
        if let Err(e) = conn.write_envelope(envelope, &self.cors).await {
            debug!(peer = %conn.peer_addr(), error = %e, "failed to write response");
        }
        conn.close_quietly().await;
    }
}

/// Runs the handler's HTTP method, turning errors and panics into `500`s.
async fn invoke_http(
    handler: &mut dyn Handler,
    ctx: Context,
    conn: &mut Connection,
    path: &str,
) -> ResponseEnvelope {
    let outcome = AssertUnwindSafe(handler.handle_http(ctx, conn))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(envelope)) => envelope,
        Ok(Err(e)) => {
            error!(path = %path, error = %e, "handler failed");
            ResponseEnvelope::internal_error(InternalErrorCode::HandlerFailed, e.to_string())
        }
        Err(_) => {
            error!(path = %path, "handler panicked");
            ResponseEnvelope::internal_error(InternalErrorCode::HandlerPanicked, "")
        }
    }
}

/// True when the last path segment is `ping`.
fn is_ping(path: &str) -> bool {
    path.trim_end_matches('/').rsplit('/').next() == Some("ping")
}
