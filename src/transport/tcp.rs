//! TCP transport.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use super::{Acceptor, BoxFuture, Connection, Connector};
use crate::error::{Result, SessionError};

/// Connects to a fixed `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| SessionError::ConnectFailed(format!("{}: {e}", self.addr)))?;
            stream.set_nodelay(true)?;
            let peer = stream
                .peer_addr()
                .map_or_else(|_| self.addr.clone(), |a| a.to_string());
            let (reader, writer) = stream.into_split();
            Ok(Connection::new(reader, writer, peer))
        })
    }
}

/// Listening TCP socket.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to `addr`; port 0 picks a free port.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl Acceptor for TcpAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            let (stream, addr) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok(Connection::new(reader, writer, addr.to_string()))
        })
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map_or_else(|_| "tcp:unbound".to_string(), |a| a.to_string())
    }
}
