//! Async TCP server using Tokio.
//!
//! Binds every configured listen prefix, accepts connections and hands each
//! one to the dispatcher on its own task. Listener failures are retried with
//! a fixed delay until a consecutive-failure limit is reached.
//!
//! ```text
//! NotStarted ─► Starting ─┬─► Running ─┬─► Stopped
//!                  ▲      │            │
//!                  │      ▼            ▼
//!                  └── Retrying ◄──────┘
//!                         │
//!                         ▼
//!                 PermanentlyFailed
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::select_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::handler::HandlerFactory;
use crate::router::{Router, UpgradePolicy};
use crate::security::WebhookValidator;

mod connection;
mod dispatch;
mod listener;
mod retry;

pub use connection::{BoxedIo, Connection, Io};

use dispatch::Dispatcher;
use listener::{Bind, Listener, TcpBind};
use retry::FailureCounter;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    /// Binding the listen addresses.
    Starting,
    Running,
    /// Waiting out the retry delay after a listener failure.
    Retrying,
    /// The consecutive-failure limit was reached; [`Server::run`] has returned.
    PermanentlyFailed,
    Stopped,
}

/// How one pass of the accept loop ended.
enum AcceptExit {
    Shutdown,
    Failed(std::io::Error),
}

/// The request-dispatch server.
///
/// Register routes, then call [`run`](Self::run); it resolves once the
/// server is stopped or has failed permanently. [`stop`](Self::stop) may be
/// called from any task.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use gatehouse::config::ServerConfig;
/// use gatehouse::envelope::ResponseEnvelope;
/// use gatehouse::handler;
/// use gatehouse::http::StatusCode;
/// use gatehouse::router::UpgradePolicy;
/// use gatehouse::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Arc::new(Server::new(ServerConfig::new(["http://+:8080/"]))?);
///     server.register(
///         ["/hello"],
///         handler::from_fn(|_ctx| async {
///             Ok(ResponseEnvelope::success(StatusCode::Ok, "Hello!"))
///         }),
///         UpgradePolicy::HttpOnly,
///     )?;
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    config: Arc<ServerConfig>,
    addrs: Vec<String>,
    // Taken by `run`; `None` afterwards.
    pending_routes: Mutex<Option<Router>>,
    binder: Box<dyn Bind>,
    listeners: tokio::sync::Mutex<Option<Vec<Box<dyn Listener>>>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
    state: watch::Sender<ServerState>,
    shutdown: watch::Sender<bool>,
    webhook: WebhookValidator,
    failures: FailureCounter,
}

impl Server {
    /// Validates `config` and creates a server in [`ServerState::NotStarted`].
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for a missing or unsupported listen prefix, or if the
    /// webhook HTTP client cannot be built.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let addrs = config.listen_addrs()?;
        let webhook = WebhookValidator::new(config.webhook_validation_delay())?;
        let failures = FailureCounter::new(config.max_consecutive_failures);

        Ok(Self {
            config: Arc::new(config),
            addrs,
            pending_routes: Mutex::new(Some(Router::new())),
            binder: Box::new(TcpBind),
            listeners: tokio::sync::Mutex::new(None),
            local_addrs: Mutex::new(Vec::new()),
            state: watch::Sender::new(ServerState::NotStarted),
            shutdown: watch::Sender::new(false),
            webhook,
            failures,
        })
    }

    /// Replaces the routing table before the server starts.
    ///
    /// # Errors
    ///
    /// [`ConfigError::AlreadyRunning`] once [`run`](Self::run) has been called.
    pub fn with_router(self, router: Router) -> Result<Self, ConfigError> {
        {
            let mut pending = lock(&self.pending_routes);
            match pending.as_mut() {
                Some(routes) => *routes = router,
                None => return Err(ConfigError::AlreadyRunning),
            }
        }
        Ok(self)
    }

    /// Binds every pattern in `prefixes` to `factory`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyPrefixes`] for an empty set, or
    /// [`ConfigError::AlreadyRunning`] once [`run`](Self::run) has been called.
    pub fn register<I, S>(
        &self,
        prefixes: I,
        factory: HandlerFactory,
        policy: UpgradePolicy,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        lock(&self.pending_routes)
            .as_mut()
            .ok_or(ConfigError::AlreadyRunning)?
            .register(prefixes, factory, policy)
    }

    /// Swaps the socket source, before [`run`](Self::run).
    #[cfg(test)]
    fn with_binder(mut self, binder: impl Bind + 'static) -> Self {
        self.binder = Box::new(binder);
        self
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Addresses actually bound while running; empty otherwise.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.local_addrs).clone()
    }

    /// Returns the number of listener failures since the last successful
    /// bind or accept.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.consecutive()
    }

    /// Returns the configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs the listen/accept loop until [`stop`](Self::stop) is called or
    /// the failure limit is reached. Both end with `Ok(())`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::AlreadyRunning`] if called more than once.
    pub async fn run(&self) -> Result<(), ServerError> {
        let router = lock(&self.pending_routes)
            .take()
            .ok_or(ConfigError::AlreadyRunning)?;
        let dispatcher = Arc::new(Dispatcher::new(
            router,
            self.webhook.clone(),
            Arc::new(self.config.deployment.clone()),
            self.config.max_request_size,
        ));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let stopping = *shutdown.borrow_and_update();
            if stopping {
                break;
            }
            self.set_state(ServerState::Starting);

            let failure: ServerError = match self.start_listening().await {
                Ok(()) => {
                    self.failures.record_success();
                    self.set_state(ServerState::Running);
                    match self.accept_loop(&dispatcher, &mut shutdown).await {
                        AcceptExit::Shutdown => break,
                        AcceptExit::Failed(e) => {
                            error!(error = %e, "failed to accept connection");
                            e.into()
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to start listening");
                    e
                }
            };

            self.drop_listeners().await;
            let streak = self.failures.record_failure();
            debug!(error = %failure, consecutive = streak, "listener failure recorded");

            if self.failures.exhausted() {
                error!(
                    failures = streak,
                    limit = self.failures.limit(),
                    "giving up after consecutive listener failures"
                );
                self.set_state(ServerState::PermanentlyFailed);
                return Ok(());
            }

            let delay = self.config.retry_delay();
            warn!(consecutive = streak, delay = ?delay, "retrying listener start");
            self.set_state(ServerState::Retrying);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.drop_listeners().await;
        self.set_state(ServerState::Stopped);
        info!("server stopped");
        Ok(())
    }

    /// Stops accepting connections. In-flight connections finish on their own.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.drop_listeners().await;
        if self.state() == ServerState::NotStarted {
            self.set_state(ServerState::Stopped);
        }
    }

    async fn start_listening(&self) -> Result<(), ServerError> {
        let mut bound = Vec::with_capacity(self.addrs.len());
        for addr in &self.addrs {
            let listener = self
                .binder
                .bind(addr.as_str())
                .await
                .map_err(|e| ServerError::Bind {
                    addr: addr.clone(),
                    source: e,
                })?;
            bound.push(listener);
        }

        let local = bound
            .iter()
            .map(|listener| listener.local_addr())
            .collect::<Result<Vec<_>, _>>()?;
        for addr in &local {
            info!(address = %addr, "listening");
        }

        *lock(&self.local_addrs) = local;
        *self.listeners.lock().await = Some(bound);
        Ok(())
    }

    async fn accept_loop(
        &self,
        dispatcher: &Arc<Dispatcher>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AcceptExit {
        loop {
            let accepted = {
                let guard = self.listeners.lock().await;
                let Some(listeners) = guard.as_ref() else {
                    return AcceptExit::Shutdown;
                };
                let accepts = listeners.iter().map(|l| l.accept());

                tokio::select! {
                    _ = shutdown.changed() => return AcceptExit::Shutdown,
                    (result, _, _) = select_all(accepts) => result,
                }
            };

            match accepted {
                Ok((io, peer)) => {
                    self.failures.record_success();
                    let dispatcher = Arc::clone(dispatcher);
                    tokio::spawn(dispatcher.serve(io, peer));
                }
                Err(e) => return AcceptExit::Failed(e),
            }
        }
    }

    async fn drop_listeners(&self) {
        if self.listeners.lock().await.take().is_some() {
            debug!("listeners closed");
        }
        lock(&self.local_addrs).clear();
    }

    fn set_state(&self, state: ServerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "server state changed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::listener::{AcceptFuture, BindFuture};

    const WAIT: Duration = Duration::from_secs(5);

    /// Binds TCP listeners whose next `failing` accepts return an error,
    /// counted across every listener it has bound.
    struct FlakyBind {
        failing: Arc<AtomicU32>,
    }

    impl FlakyBind {
        fn new(failing: u32) -> Self {
            Self {
                failing: Arc::new(AtomicU32::new(failing)),
            }
        }
    }

    struct FlakyListener {
        inner: TcpListener,
        failing: Arc<AtomicU32>,
    }

    impl Listener for FlakyListener {
        fn accept(&self) -> AcceptFuture<'_> {
            let fail = self
                .failing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Box::pin(async { Err(io::Error::other("accept failed")) });
            }
            Listener::accept(&self.inner)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    impl Bind for FlakyBind {
        fn bind<'a>(&'a self, addr: &'a str) -> BindFuture<'a> {
            Box::pin(async move {
                let inner = TcpListener::bind(addr).await?;
                let listener = FlakyListener {
                    inner,
                    failing: Arc::clone(&self.failing),
                };
                Ok(Box::new(listener) as Box<dyn Listener>)
            })
        }
    }

    fn loopback() -> ServerConfig {
        ServerConfig::new(["http://127.0.0.1:0/"])
    }

    #[tokio::test]
    async fn accept_failure_goes_through_retry() {
        let config = loopback().with_retry_delay(Duration::from_millis(300));
        let server = Arc::new(Server::new(config).unwrap().with_binder(FlakyBind::new(1)));
        let mut states = server.subscribe();

        let runner = Arc::clone(&server);
        let task = tokio::spawn(async move { runner.run().await });

        tokio::time::timeout(WAIT, states.wait_for(|s| *s == ServerState::Retrying))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.consecutive_failures(), 1);
        assert!(server.local_addrs().is_empty());

        tokio::time::timeout(WAIT, states.wait_for(|s| *s == ServerState::Running))
            .await
            .unwrap()
            .unwrap();

        // The rebound listener serves connections again.
        let addr = server.local_addrs()[0];
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /nowhere HTTP/1.1\r\nHost: test\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        tokio::time::timeout(WAIT, client.read_to_string(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(server.consecutive_failures(), 0);
        assert_eq!(server.state(), ServerState::Running);

        server.stop().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn accept_failure_counts_toward_the_limit() {
        let config = loopback()
            .with_max_consecutive_failures(1)
            .with_retry_delay(Duration::from_millis(10));
        let server = Server::new(config).unwrap().with_binder(FlakyBind::new(u32::MAX));

        tokio::time::timeout(WAIT, server.run())
            .await
            .expect("run did not give up")
            .unwrap();

        assert_eq!(server.state(), ServerState::PermanentlyFailed);
        assert_eq!(server.consecutive_failures(), 1);
        assert!(server.local_addrs().is_empty());
    }
}
