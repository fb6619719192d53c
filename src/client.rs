//! Client builder.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring handlers and
//! session settings, then dials a server:
//! 1. Start the session worker pool (or reuse a shared one)
//! 2. Spawn the session, which connects and sends its handshake
//! 3. Wait until the server accepts it
//!
//! # Example
//!
//! ```no_run
//! use sessionwire::transport::TcpConnector;
//! use sessionwire::{SessionClient, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = SessionClient::builder()
//!         .on_message(|value: Value, _session| async move {
//!             println!("server says {value:?}");
//!         })
//!         .connect(TcpConnector::new("127.0.0.1:7000"))
//!         .await?;
//!
//!     let reply = session.call(1, 1, Value::Int(21)).await?;
//!     println!("reply: {reply:?}");
//!     session.close();
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;

use crate::codec::{Value, WireCodec};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::heartbeat::HeartbeatPolicy;
use crate::rpc::{HandlerResult, RpcContext, RpcDispatcher, RpcFault};
use crate::session::{Endpoint, Session, SessionSetup, ShardPool};
use crate::transport::Connector;

/// Builder for client sessions.
pub struct ClientBuilder {
    config: SessionConfig,
    dispatcher: RpcDispatcher,
    codec: Option<Arc<WireCodec>>,
    pool: Option<Arc<ShardPool>>,
    session_id: Option<String>,
    client_identity: u64,
    /// First registration error, reported by `connect`.
    error: Option<SessionError>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            dispatcher: RpcDispatcher::new(),
            codec: None,
            pool: None,
            session_id: None,
            client_identity: 0,
            error: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Codec with the application's entity registry.
    pub fn codec(mut self, codec: Arc<WireCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Run the session on an existing worker pool.
    pub fn shard_pool(mut self, pool: Arc<ShardPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Fixed session id; a random one is generated otherwise.
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Identity announced in the handshake.
    pub fn client_identity(mut self, identity: u64) -> Self {
        self.client_identity = identity;
        self
    }

    /// Register a handler for requests the server sends to this client.
    pub fn handle<F, Fut>(mut self, service_id: u16, method_id: u16, handler: F) -> Self
    where
        F: Fn(Value, RpcContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let result = self.dispatcher.register(service_id, method_id, handler);
        self.keep_first_error(result);
        self
    }

    /// Register a handler taking and returning serde types.
    pub fn handle_typed<F, T, R, Fut>(mut self, service_id: u16, method_id: u16, handler: F) -> Self
    where
        F: Fn(T, RpcContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, RpcFault>> + Send + 'static,
    {
        let result = self.dispatcher.register_typed(service_id, method_id, handler);
        self.keep_first_error(result);
        self
    }

    /// Callback for one-way messages from the server.
    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.dispatcher.on_message(handler);
        self
    }

    pub fn heartbeat(mut self, policy: HeartbeatPolicy) -> Self {
        self.config.heartbeat = policy;
        self
    }

    pub fn ping_interval_ms(mut self, ms: u64) -> Self {
        self.config.ping_interval_ms = ms;
        self
    }

    pub fn session_timeout_ms(mut self, ms: u64) -> Self {
        self.config.session_timeout_ms = ms;
        self
    }

    pub fn rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.rpc_timeout_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_interval_ms = ms;
        self
    }

    pub fn max_connect_try_times(mut self, times: u32) -> Self {
        self.config.max_connect_try_times = times;
        self
    }

    pub fn max_pending_messages(mut self, limit: usize) -> Self {
        self.config.max_pending_messages = limit;
        self
    }

    pub fn max_cache_messages(mut self, limit: usize) -> Self {
        self.config.max_cache_messages = limit;
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// Requests beyond the limit are answered with `SERVER_BUSY`.
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    fn keep_first_error(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    /// Start the session without waiting for the handshake.
    ///
    /// Must be called inside a tokio runtime; transport and handler tasks
    /// run on it.
    pub fn start<C: Connector>(self, connector: C) -> Result<Session> {
        let Self {
            config,
            mut dispatcher,
            codec,
            pool,
            session_id,
            client_identity,
            error,
        } = self;
        if let Some(e) = error {
            return Err(e);
        }
        config.validate()?;
        dispatcher.set_max_concurrent_handlers(config.max_concurrent_handlers);

        let runtime = Handle::try_current()
            .map_err(|e| SessionError::InvalidConfig(format!("no tokio runtime: {e}")))?;
        let pool = match pool {
            Some(pool) => pool,
            None => ShardPool::new("sessionwire-client", config.shard_count())?,
        };
        let id = session_id.unwrap_or_else(random_session_id);
        tracing::debug!(session_id = %id, shards = pool.len(), "starting client session");

        Ok(Session::spawn(
            SessionSetup {
                id,
                remote_identity: 0,
                endpoint: Endpoint::Client {
                    connector: Arc::new(connector),
                    client_identity,
                },
                config: Arc::new(config),
                codec: codec.unwrap_or_default(),
                dispatcher: Arc::new(dispatcher),
                pool,
                runtime,
            },
            None,
        ))
    }

    /// Start the session and wait until the server accepts it.
    ///
    /// # Errors
    ///
    /// [`SessionError::HandshakeRejected`] if the server refuses the session,
    /// [`SessionError::ConnectFailed`] once every attempt has failed.
    pub async fn connect<C: Connector>(self, connector: C) -> Result<Session> {
        let session = self.start(connector)?;
        session.established().await?;
        Ok(session)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for client sessions.
pub struct SessionClient;

impl SessionClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }
}

fn random_session_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNetwork;

    #[test]
    fn test_builder_default() {
        let builder = ClientBuilder::default();
        assert_eq!(builder.config, SessionConfig::default());
        assert!(builder.dispatcher.is_empty());
    }

    #[test]
    fn test_builder_method_chaining() {
        let builder = SessionClient::builder()
            .handle(1, 1, |v: Value, _ctx| async move { Ok(v) })
            .handle(1, 2, |_: Value, _ctx| async { Ok(Value::Null) })
            .on_message(|_v: Value, _s| async {})
            .session_id("player-7")
            .client_identity(42);

        assert!(builder.dispatcher.contains(1, 1));
        assert!(builder.dispatcher.contains(1, 2));
        assert_eq!(builder.session_id.as_deref(), Some("player-7"));
        assert_eq!(builder.client_identity, 42);
        assert!(builder.error.is_none());
    }

    #[test]
    fn test_builder_configuration() {
        let builder = SessionClient::builder()
            .heartbeat(HeartbeatPolicy::PingPing)
            .ping_interval_ms(100)
            .session_timeout_ms(1_000)
            .max_cache_messages(8)
            .max_concurrent_handlers(512);

        assert_eq!(builder.config.heartbeat, HeartbeatPolicy::PingPing);
        assert_eq!(builder.config.ping_interval_ms, 100);
        assert_eq!(builder.config.session_timeout_ms, 1_000);
        assert_eq!(builder.config.max_cache_messages, 8);
        assert_eq!(builder.config.max_concurrent_handlers, 512);
    }

    #[tokio::test]
    async fn test_duplicate_handler_reported_on_start() {
        let net = LoopbackNetwork::new();
        let result = SessionClient::builder()
            .handle(1, 1, |_: Value, _ctx| async { Ok(Value::Null) })
            .handle(1, 1, |_: Value, _ctx| async { Ok(Value::Null) })
            .start(net.connector("server"));
        assert!(matches!(result, Err(SessionError::DuplicateHandler { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let net = LoopbackNetwork::new();
        let result = SessionClient::builder()
            .ping_interval_ms(5_000)
            .session_timeout_ms(1_000)
            .start(net.connector("server"));
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_connect_fails_after_max_attempts() {
        let net = LoopbackNetwork::new();
        let result = SessionClient::builder()
            .config(SessionConfig {
                shards: 1,
                ..SessionConfig::default()
            })
            .reconnect_interval_ms(5)
            .max_connect_try_times(3)
            .connect(net.connector("nobody-listening"))
            .await;
        assert!(matches!(result, Err(SessionError::ConnectFailed(_))));
    }

    #[test]
    fn test_random_session_ids_differ() {
        let a = random_session_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, random_session_id());
    }
}
