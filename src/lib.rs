//! # gatehouse
//!
//! An embeddable async request-dispatch server: wildcard prefix routing,
//! per-request handlers, WebSocket handoff, CORS and webhook validation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gatehouse::config::ServerConfig;
//! use gatehouse::envelope::ResponseEnvelope;
//! use gatehouse::handler;
//! use gatehouse::http::StatusCode;
//! use gatehouse::router::UpgradePolicy;
//! use gatehouse::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::new(["http://127.0.0.1:8080/"]))?;
//!     server.register(
//!         ["/users/*/orders"],
//!         handler::from_fn(|ctx| async move {
//!             let user = ctx.restful_param("users").unwrap_or_default().to_owned();
//!             Ok(ResponseEnvelope::success(StatusCode::Ok, format!("orders of {user}")))
//!         }),
//!         UpgradePolicy::HttpOnly,
//!     )?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod envelope;
pub mod handler;
pub mod http;
pub mod realtime;
pub mod router;
pub mod security;
pub mod server;

pub use config::{ConfigError, Deployment, ServerConfig};
pub use context::{Context, RequestContext};
pub use envelope::{Body, ResponseEnvelope};
pub use handler::{Capabilities, Handler, HandlerError, HandlerFactory};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::{Router, UpgradePolicy};
pub use server::{Server, ServerError, ServerState};
