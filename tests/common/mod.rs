//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatehouse::config::ServerConfig;
use gatehouse::server::{Server, ServerError, ServerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

/// A server running on an ephemeral loopback port.
pub struct Running {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    pub async fn shutdown(self) {
        self.server.stop().await;
        let _ = tokio::time::timeout(WAIT, self.task).await;
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig::new(["http://127.0.0.1:0/"])
        .with_retry_delay(Duration::from_millis(10))
        .with_webhook_validation_delay(Duration::from_millis(200))
}

/// Runs `server` and waits until it is accepting connections.
pub async fn start(server: Server) -> Running {
    let server = Arc::new(server);
    let mut states = server.subscribe();

    let runner = Arc::clone(&server);
    let task = tokio::spawn(async move { runner.run().await });

    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ServerState::Running))
        .await
        .expect("server did not start in time")
        .expect("state channel closed");

    let addr = server.local_addrs()[0];
    Running { server, addr, task }
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl RawResponse {
    /// Case-insensitive lookup of a response header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("body is not JSON")
    }
}

/// Sends `raw` and reads until the server closes the connection.
pub async fn send_raw(addr: SocketAddr, raw: &str) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut out = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();

    let text = String::from_utf8_lossy(&out).into_owned();
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);

    RawResponse {
        status,
        head: head.to_owned(),
        body: body.to_owned(),
    }
}

pub async fn get(addr: SocketAddr, path: &str) -> RawResponse {
    send_raw(addr, &format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n")).await
}

/// A one-shot HTTP endpoint recording the first request it receives.
pub struct Capture {
    pub url: String,
    task: JoinHandle<(Instant, String)>,
}

impl Capture {
    pub async fn start(path: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}{path}", listener.local_addr().unwrap());

        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let received_at = Instant::now();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            let _ = socket.shutdown().await;
            (received_at, String::from_utf8_lossy(&buf[..n]).into_owned())
        });

        Self { url, task }
    }

    /// The arrival time and text of the captured request.
    pub async fn received(self) -> (Instant, String) {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("no request captured")
            .unwrap()
    }
}
