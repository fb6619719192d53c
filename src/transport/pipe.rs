//! Unix Domain Socket transport.
//!
//! # Example
//!
//! ```ignore
//! use sessionwire::transport::{generate_pipe_path, PipeAcceptor, PipeConnector};
//!
//! let path = generate_pipe_path();
//! let acceptor = PipeAcceptor::bind(&path)?;
//! let connector = PipeConnector::new(&path);
//! ```

use std::path::Path;

use rand::Rng;
use tokio::net::{UnixListener, UnixStream};

use super::{Acceptor, BoxFuture, Connection, Connector};
use crate::error::{Result, SessionError};

/// Generate a unique socket path for this process.
///
/// Format: `{tmp}/sessionwire-{pid}-{random}.sock`
pub fn generate_pipe_path() -> String {
    let pid = std::process::id();
    let suffix: u64 = rand::thread_rng().gen();
    std::env::temp_dir()
        .join(format!("sessionwire-{pid}-{suffix:x}.sock"))
        .to_string_lossy()
        .into_owned()
}

#[derive(Debug, Clone)]
pub struct PipeConnector {
    path: String,
}

impl PipeConnector {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for PipeConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            let stream = UnixStream::connect(&self.path)
                .await
                .map_err(|e| SessionError::ConnectFailed(format!("{}: {e}", self.path)))?;
            let (reader, writer) = stream.into_split();
            Ok(Connection::new(reader, writer, self.path.clone()))
        })
    }
}

/// Unix socket listener. Removes its socket file on drop.
#[derive(Debug)]
pub struct PipeAcceptor {
    listener: UnixListener,
    path: String,
}

impl PipeAcceptor {
    /// Bind to a socket path, replacing a stale socket file.
    pub fn bind(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PipeAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Acceptor for PipeAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            let (stream, _addr) = self.listener.accept().await?;
            let (reader, writer) = stream.into_split();
            Ok(Connection::new(reader, writer, format!("unix:{}", self.path)))
        })
    }

    fn local_addr(&self) -> String {
        format!("unix:{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_generate_pipe_path_unique() {
        let a = generate_pipe_path();
        let b = generate_pipe_path();
        assert_ne!(a, b);
        assert!(a.ends_with(".sock"));
        assert!(a.contains(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_pipe_roundtrip_and_cleanup() {
        let path = generate_pipe_path();
        let mut acceptor = PipeAcceptor::bind(&path).unwrap();
        let connector = PipeConnector::new(&path);

        let (client, server) = tokio::join!(connector.connect(), acceptor.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        server.writer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(acceptor);
        assert!(!Path::new(&path).exists());
    }
}
