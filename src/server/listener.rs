//! Listening sockets behind a small trait, so the accept loop does not care
//! where its connections come from.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::TcpListener;

use super::connection::BoxedIo;

pub(crate) type AcceptFuture<'a> =
    Pin<Box<dyn Future<Output = io::Result<(BoxedIo, SocketAddr)>> + Send + 'a>>;

pub(crate) type BindFuture<'a> =
    Pin<Box<dyn Future<Output = io::Result<Box<dyn Listener>>> + Send + 'a>>;

/// A bound socket producing client connections.
pub(crate) trait Listener: Send + Sync {
    fn accept(&self) -> AcceptFuture<'_>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Opens a [`Listener`] for a `host:port` address.
pub(crate) trait Bind: Send + Sync {
    fn bind<'a>(&'a self, addr: &'a str) -> BindFuture<'a>;
}

impl Listener for TcpListener {
    fn accept(&self) -> AcceptFuture<'_> {
        Box::pin(async move {
            let (stream, peer) = TcpListener::accept(self).await?;
            Ok((Box::new(stream) as BoxedIo, peer))
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Binds plain TCP listeners.
pub(crate) struct TcpBind;

impl Bind for TcpBind {
    fn bind<'a>(&'a self, addr: &'a str) -> BindFuture<'a> {
        Box::pin(async move {
            let listener = TcpListener::bind(addr).await?;
            Ok(Box::new(listener) as Box<dyn Listener>)
        })
    }
}
