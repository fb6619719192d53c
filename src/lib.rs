//! # sessionwire
//!
//! Session-oriented reliable messaging with integrated RPC.
//!
//! A session is one logical peer link that survives reconnects: every
//! message carries a sequence number and a cumulative ack, unacknowledged
//! messages are resent after a reconnect, and duplicates are dropped on
//! arrival. RPC calls, responses and one-way messages all travel inside
//! the session.
//!
//! ## Architecture
//!
//! - **Codec** ([`codec`]): one-byte-tagged values, entity descriptors and
//!   MessagePack payloads
//! - **Frames** ([`protocol`]): length-prefixed, checksummed frames
//! - **Session** ([`session`]): message queue, handshake, heartbeat and
//!   reconnect, run on a pinned worker thread per session
//! - **RPC** ([`rpc`]): call correlation and handler dispatch
//! - **Transports** ([`transport`]): TCP, WebSocket, Unix sockets and an
//!   in-process loopback
//!
//! ## Example
//!
//! ```no_run
//! use sessionwire::transport::{TcpAcceptor, TcpConnector};
//! use sessionwire::{SessionClient, SessionServer, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = SessionServer::builder()
//!         .handle(1, 1, |args: Value, _ctx| async move { Ok(args) })
//!         .bind(TcpAcceptor::bind("127.0.0.1:7000").await?)?;
//!
//!     let client = SessionClient::builder()
//!         .connect(TcpConnector::new("127.0.0.1:7000"))
//!         .await?;
//!     let _peer = server.accept().await;
//!
//!     let echoed = client.call(1, 1, "hello").await?;
//!     assert_eq!(echoed.as_str(), Some("hello"));
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod queue;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod writer;

mod client;
mod server;

pub use client::{ClientBuilder, SessionClient};
pub use codec::{EntityRegistry, Value, WireCodec, WireType};
pub use config::SessionConfig;
pub use error::{Result, SessionError, WireError};
pub use heartbeat::HeartbeatPolicy;
pub use rpc::{HandlerResult, RpcContext, RpcDispatcher, RpcFault};
pub use server::{ServerBuilder, SessionServer, DEFAULT_TOMBSTONE_CAPACITY};
pub use session::{CloseReason, Session, SessionState, SessionStats, ShardId, ShardPool};
