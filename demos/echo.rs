//! Echo server demo.
//!
//! ```text
//! RUST_LOG=gatehouse=debug cargo run --example echo
//! curl 'http://127.0.0.1:8080/users/7/orders?limit=2'
//! websocat ws://127.0.0.1:8080/echo
//! ```

use std::sync::Arc;

use gatehouse::context::Context;
use gatehouse::envelope::ResponseEnvelope;
use gatehouse::handler::{self, Capabilities, Handler, HandlerFuture};
use gatehouse::http::StatusCode;
use gatehouse::realtime::{Message, WebSocket};
use gatehouse::router::UpgradePolicy;
use gatehouse::server::Server;
use gatehouse::ServerConfig;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

struct Echo;

impl Handler for Echo {
    fn capabilities(&self) -> Capabilities {
        Capabilities::WebSocket
    }

    fn handle_websocket<'a>(
        &'a mut self,
        _ctx: Context,
        socket: &'a mut WebSocket,
    ) -> HandlerFuture<'a, ()> {
        Box::pin(async move {
            while let Some(message) = socket.recv().await {
                match message? {
                    msg @ (Message::Text(_) | Message::Binary(_)) => socket.send(msg).await?,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gatehouse=info")),
        )
        .init();

    let config = match std::env::var("GATEHOUSE_CONFIG") {
        Ok(path) => ServerConfig::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => ServerConfig::new(["http://127.0.0.1:8080/"]),
    };
    let server = Arc::new(Server::new(config)?);

    server.register(
        ["/users/*/orders"],
        handler::from_fn(|ctx| async move {
            let mut fields = Map::new();
            for (key, value) in ctx.params().restful_params().iter() {
                fields.insert(key.to_owned(), Value::from(value));
            }
            for (key, value) in ctx.params().query_params().iter() {
                fields.insert(format!("query.{key}"), Value::from(value));
            }
            Ok(ResponseEnvelope::success_with(
                StatusCode::Ok,
                format!("{} {}", ctx.request().method(), ctx.request().path()),
                fields,
            ))
        }),
        UpgradePolicy::HttpOnly,
    )?;
    server.register(["/echo"], handler::factory(|| Echo), UpgradePolicy::WebSocketOnly)?;

    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            runner.stop().await;
        }
    });

    server.run().await?;
    Ok(())
}
