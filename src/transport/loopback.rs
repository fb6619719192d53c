//! In-process transport.
//!
//! Listeners are registered by name on a [`LoopbackNetwork`]. Each
//! connection is relayed through a proxy task so the network can cut every
//! live link at once with [`LoopbackNetwork::sever_all`]; both ends then see
//! EOF, exactly like a dropped TCP connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, watch};

use super::{Acceptor, BoxFuture, Connection, Connector};
use crate::error::{Result, SessionError};

const PIPE_CAPACITY: usize = 256 * 1024;
const BACKLOG: usize = 64;

#[derive(Debug)]
struct Inner {
    listeners: Mutex<HashMap<String, mpsc::Sender<Connection>>>,
    sever: watch::Sender<u64>,
}

/// Registry of named in-process listeners.
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Inner>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        let (sever, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(HashMap::new()),
                sever,
            }),
        }
    }

    /// Register a listener; a previous one under the same name is replaced.
    pub fn listen(&self, name: &str) -> LoopbackAcceptor {
        let (tx, rx) = mpsc::channel(BACKLOG);
        self.lock().insert(name.to_string(), tx);
        LoopbackAcceptor {
            name: name.to_string(),
            incoming: rx,
        }
    }

    pub fn connector(&self, name: &str) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
            name: name.to_string(),
        }
    }

    /// Stop accepting under `name`. Existing links are unaffected.
    pub fn close_listener(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Cut every live link.
    pub fn sever_all(&self) {
        self.inner.sever.send_modify(|n| *n += 1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Connection>>> {
        self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn dial(&self, name: &str) -> Result<Connection> {
        let listener = self
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::ConnectFailed(format!("no loopback listener '{name}'")))?;

        let (client_end, proxy_client) = duplex(PIPE_CAPACITY);
        let (server_end, proxy_server) = duplex(PIPE_CAPACITY);
        spawn_proxy(proxy_client, proxy_server, self.inner.sever.subscribe());

        listener
            .send(Connection::from_stream(server_end, format!("loopback:{name}:client")))
            .await
            .map_err(|_| SessionError::ConnectFailed(format!("loopback listener '{name}' closed")))?;
        Ok(Connection::from_stream(client_end, format!("loopback:{name}")))
    }
}

fn spawn_proxy(mut a: DuplexStream, mut b: DuplexStream, mut sever: watch::Receiver<u64>) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut a, &mut b) => {
                tracing::trace!(?result, "loopback link finished");
            }
            _ = sever.changed() => {
                tracing::trace!("loopback link severed");
            }
        }
    });
}

#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
    name: String,
}

impl Connector for LoopbackConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(self.network.dial(&self.name))
    }
}

#[derive(Debug)]
pub struct LoopbackAcceptor {
    name: String,
    incoming: mpsc::Receiver<Connection>,
}

impl Acceptor for LoopbackAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move { self.incoming.recv().await.ok_or(SessionError::ConnectionClosed) })
    }

    fn local_addr(&self) -> String {
        format!("loopback:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let net = LoopbackNetwork::new();
        let mut acceptor = net.listen("game");
        let mut client = net.connector("game").connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        client.writer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(acceptor.local_addr(), "loopback:game");
    }

    #[tokio::test]
    async fn test_unknown_listener_fails() {
        let net = LoopbackNetwork::new();
        let result = net.connector("missing").connect().await;
        assert!(matches!(result, Err(SessionError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_sever_all_gives_eof_on_both_sides() {
        let net = LoopbackNetwork::new();
        let mut acceptor = net.listen("game");
        let mut client = net.connector("game").connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        net.sever_all();

        let mut buf = [0u8; 1];
        assert_eq!(client.reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(server.reader.read(&mut buf).await.unwrap(), 0);

        // New links still work after a sever.
        let mut again = net.connector("game").connect().await.unwrap();
        let mut peer = acceptor.accept().await.unwrap();
        again.writer.write_all(b"x").await.unwrap();
        peer.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_close_listener() {
        let net = LoopbackNetwork::new();
        let _acceptor = net.listen("game");
        net.close_listener("game");
        assert!(net.connector("game").connect().await.is_err());
    }
}
