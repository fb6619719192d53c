//! WebSocket transport.
//!
//! Each binary WebSocket message carries an arbitrary slice of the frame
//! stream; the session layer reassembles frames itself, so message
//! boundaries carry no meaning. A pump task bridges the socket to an
//! in-memory duplex pipe handed to the session as a plain byte stream.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};

use super::{Acceptor, BoxFuture, Connection, Connector};
use crate::error::{Result, SessionError};

const PIPE_CAPACITY: usize = 256 * 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Connects to a `ws://` URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            let (ws, _response) = connect_async(self.url.as_str())
                .await
                .map_err(|e| SessionError::ConnectFailed(format!("{}: {e}", self.url)))?;
            Ok(bridge(ws, self.url.clone()))
        })
    }
}

/// Accepts WebSocket upgrades on a TCP listener.
#[derive(Debug)]
pub struct WsAcceptor {
    listener: TcpListener,
}

impl WsAcceptor {
    pub async fn bind(addr: &str) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    /// `ws://` URL clients should dial.
    pub fn url(&self) -> Result<String> {
        Ok(format!("ws://{}", self.listener.local_addr()?))
    }
}

impl Acceptor for WsAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            loop {
                let (stream, addr) = self.listener.accept().await?;
                stream.set_nodelay(true)?;
                match accept_async(stream).await {
                    Ok(ws) => return Ok(bridge(ws, format!("ws:{addr}"))),
                    Err(e) => tracing::warn!(peer = %addr, error = %e, "websocket upgrade failed"),
                }
            }
        })
    }

    fn local_addr(&self) -> String {
        self.url().unwrap_or_else(|_| "ws:unbound".to_string())
    }
}

fn bridge<S>(ws: WebSocketStream<S>, peer: String) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (app_end, pump_end) = duplex(PIPE_CAPACITY);
    let label = peer.clone();
    tokio::spawn(async move {
        if let Err(e) = pump(ws, pump_end).await {
            tracing::debug!(peer = %label, error = %e, "websocket pump stopped");
        }
    });
    Connection::from_stream(app_end, peer)
}

async fn pump<S>(ws: WebSocketStream<S>, pipe: DuplexStream) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (mut pipe_rx, mut pipe_tx) = tokio::io::split(pipe);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            n = pipe_rx.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                sink.send(WsMessage::Binary(buf[..n].to_vec().into()))
                    .await
                    .map_err(std::io::Error::other)?;
            }
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Binary(data))) => pipe_tx.write_all(&data).await?,
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = sink.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Text(_))) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "text frames not allowed",
                    ));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(std::io::Error::other(e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_websocket_byte_stream() {
        let mut acceptor = WsAcceptor::bind("127.0.0.1:0").await.unwrap();
        let connector = WsConnector::new(acceptor.url().unwrap());

        let (client, server) = tokio::join!(connector.connect(), acceptor.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.writer.write_all(b"abc").await.unwrap();
        client.writer.write_all(b"def").await.unwrap();
        let mut buf = [0u8; 6];
        server.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");

        drop(client);
        let mut rest = Vec::new();
        server.reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
