//! Transport module - byte-stream links a session can run over.
//!
//! Every transport yields a [`Connection`]: boxed read and write halves plus
//! a peer description. Sessions only see the halves, so TCP, WebSocket,
//! Unix sockets and the in-process loopback are interchangeable.
//!
//! - [`TcpConnector`] / [`TcpAcceptor`]
//! - [`LoopbackNetwork`] for in-process peers and tests
//! - [`PipeConnector`] / [`PipeAcceptor`] (Unix Domain Sockets)
//! - [`WsConnector`] / [`WsAcceptor`] behind the `websocket` feature

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

mod loopback;
#[cfg(unix)]
mod pipe;
mod tcp;
#[cfg(feature = "websocket")]
mod websocket;

pub use loopback::{LoopbackAcceptor, LoopbackConnector, LoopbackNetwork};
#[cfg(unix)]
pub use pipe::{generate_pipe_path, PipeAcceptor, PipeConnector};
pub use tcp::{TcpAcceptor, TcpConnector};
#[cfg(feature = "websocket")]
pub use websocket::{WsAcceptor, WsConnector};

/// Boxed future returned by transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One physical link.
pub struct Connection {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub peer: String,
}

impl Connection {
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
        }
    }

    /// Split a bidirectional stream into a connection.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, peer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// Opens new links to one fixed peer. Called again on every reconnect.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Connection>>;
}

/// Yields inbound links.
pub trait Acceptor: Send + 'static {
    fn accept(&mut self) -> BoxFuture<'_, Result<Connection>>;

    /// Human-readable listening address.
    fn local_addr(&self) -> String;
}
