//! Cross-cutting request security: the server-wide CORS policy and the
//! CloudEvents webhook abuse-protection handshake.

pub mod cors;
pub mod webhook;

pub use cors::CorsPolicy;
pub use webhook::{Handshake, WebhookValidator};
