//! Session server.
//!
//! Accepts physical connections, reads each one's CONNECT_REQUEST and routes
//! it: a known session id re-attaches to its existing session, an unknown id
//! with `ack == 0` creates a new session, anything else is refused with
//! `success = 0` so the client learns its server-side state is gone.
//!
//! ```text
//! Acceptor ─► accept loop ─► handshake task ─┬─► Session::attach (known id)
//!                                            ├─► Session::spawn  (new id) ─► accept()
//!                                            └─► CONNECT_RESPONSE(success=0)
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{Value, WireCodec};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::heartbeat::HeartbeatPolicy;
use crate::protocol::{ConnectRequest, ConnectResponse, Decoded, Frame, FrameBuffer};
use crate::rpc::{HandlerResult, RpcContext, RpcDispatcher, RpcFault};
use crate::session::{Attach, Endpoint, Session, SessionSetup, ShardPool};
use crate::transport::{Acceptor, Connection};

/// Recently closed session ids remembered by default.
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 1024;

const HANDSHAKE_READ_SIZE: usize = 8 * 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Builder for [`SessionServer`].
pub struct ServerBuilder {
    config: SessionConfig,
    dispatcher: RpcDispatcher,
    codec: Option<Arc<WireCodec>>,
    pool: Option<Arc<ShardPool>>,
    tombstone_capacity: usize,
    error: Option<SessionError>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            dispatcher: RpcDispatcher::new(),
            codec: None,
            pool: None,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
            error: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec(mut self, codec: Arc<WireCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn shard_pool(mut self, pool: Arc<ShardPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn heartbeat(mut self, policy: HeartbeatPolicy) -> Self {
        self.config.heartbeat = policy;
        self
    }

    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// How many closed session ids to remember and refuse.
    pub fn tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = capacity;
        self
    }

    /// Register a handler shared by every session of this server.
    pub fn handle<F, Fut>(mut self, service_id: u16, method_id: u16, handler: F) -> Self
    where
        F: Fn(Value, RpcContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if let Err(e) = self.dispatcher.register(service_id, method_id, handler) {
            self.error.get_or_insert(e);
        }
        self
    }

    pub fn handle_typed<F, T, R, Fut>(mut self, service_id: u16, method_id: u16, handler: F) -> Self
    where
        F: Fn(T, RpcContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, RpcFault>> + Send + 'static,
    {
        if let Err(e) = self.dispatcher.register_typed(service_id, method_id, handler) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Callback for one-way messages from any client.
    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.dispatcher.on_message(handler);
        self
    }

    /// Start serving connections from `acceptor`.
    ///
    /// Must be called inside a tokio runtime; the accept loop, transport
    /// tasks and handlers run on it.
    pub fn bind<A: Acceptor>(self, acceptor: A) -> Result<SessionServer> {
        let Self {
            config,
            mut dispatcher,
            codec,
            pool,
            tombstone_capacity,
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
            None => ShardPool::new("sessionwire-server", config.shard_count())?,
        };
        let (new_tx, new_rx) = mpsc::unbounded_channel();
        let local_addr = acceptor.local_addr();

        let shared = Arc::new(Shared {
            config: Arc::new(config),
            codec: codec.unwrap_or_default(),
            dispatcher: Arc::new(dispatcher),
            pool,
            runtime: runtime.clone(),
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                tombstones: Tombstones::new(tombstone_capacity),
                new_sessions: Some(new_tx),
            }),
        });
        tracing::info!(addr = %local_addr, shards = shared.pool.len(), "session server listening");

        let accept_task = runtime.spawn(accept_loop(acceptor, shared.clone()));
        Ok(SessionServer {
            shared,
            new_sessions: new_rx,
            accept_task,
            local_addr,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts clients and owns the `session id -> Session` registry.
pub struct SessionServer {
    shared: Arc<Shared>,
    new_sessions: mpsc::UnboundedReceiver<Session>,
    accept_task: JoinHandle<()>,
    local_addr: String,
}

impl SessionServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Next newly created session; `None` after [`shutdown`](Self::shutdown).
    ///
    /// Re-attached sessions are not yielded again.
    pub async fn accept(&mut self) -> Option<Session> {
        self.new_sessions.recv().await
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.shared.registry().sessions.get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.shared.registry().sessions.values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.shared.registry().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Stop accepting and close every session with `CloseReason::Shutdown`.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let sessions: Vec<Session> = {
            let mut registry = self.shared.registry();
            registry.new_sessions = None;
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        tracing::info!(addr = %self.local_addr, sessions = sessions.len(), "session server shutting down");
        for session in sessions {
            session.shutdown();
        }
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct Shared {
    config: Arc<SessionConfig>,
    codec: Arc<WireCodec>,
    dispatcher: Arc<RpcDispatcher>,
    pool: Arc<ShardPool>,
    runtime: Handle,
    registry: Mutex<Registry>,
}

struct Registry {
    sessions: HashMap<String, Session>,
    tombstones: Tombstones,
    /// `None` once the server is shut down.
    new_sessions: Option<mpsc::UnboundedSender<Session>>,
}

/// Bounded FIFO set of closed session ids.
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: String) {
        if self.capacity == 0 || self.ids.contains(&id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// What to do with a connection after its handshake was read.
enum Route {
    Attached,
    Reject(Connection),
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(self: &Arc<Self>, conn: Connection, buffer: FrameBuffer, backlog: Vec<Decoded>, request: ConnectRequest) -> Route {
        let mut registry = self.registry();
        let id = request.session_id.clone();

        if registry.new_sessions.is_none() || registry.tombstones.contains(&id) {
            return Route::Reject(conn);
        }

        if let Some(session) = registry.sessions.get(&id) {
            let session = session.clone();
            drop(registry);
            let attach = Attach {
                conn,
                buffer,
                backlog,
                request,
            };
            // A failed attach means the worker just stopped; its watcher
            // will tombstone the id and the client retries into a refusal.
            if let Err(e) = session.attach(attach) {
                tracing::debug!(session_id = %id, error = %e, "re-attach to closing session");
            }
            return Route::Attached;
        }

        if request.ack != 0 {
            tracing::debug!(session_id = %id, ack = request.ack, "unknown session with state, refused");
            return Route::Reject(conn);
        }

        let session = Session::spawn(
            SessionSetup {
                id: id.clone(),
                remote_identity: request.client_identity,
                endpoint: Endpoint::Server,
                config: self.config.clone(),
                codec: self.codec.clone(),
                dispatcher: self.dispatcher.clone(),
                pool: self.pool.clone(),
                runtime: self.runtime.clone(),
            },
            Some(Attach {
                conn,
                buffer,
                backlog,
                request,
            }),
        );
        registry.sessions.insert(id.clone(), session.clone());
        if let Some(tx) = &registry.new_sessions {
            let _ = tx.send(session.clone());
        }
        drop(registry);
        tracing::debug!(session_id = %id, shard = ?session.shard(), "session created");

        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            let reason = session.closed().await;
            let mut registry = shared.registry();
            registry.sessions.remove(&id);
            registry.tombstones.insert(id.clone());
            tracing::debug!(session_id = %id, %reason, "session removed");
        });
        Route::Attached
    }
}

async fn accept_loop<A: Acceptor>(mut acceptor: A, shared: Arc<Shared>) {
    loop {
        match acceptor.accept().await {
            Ok(conn) => {
                tracing::trace!(peer = %conn.peer, "connection accepted");
                shared.runtime.spawn(handshake(conn, shared.clone()));
            }
            Err(SessionError::ConnectionClosed) => {
                tracing::debug!("acceptor closed");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
}

async fn handshake(mut conn: Connection, shared: Arc<Shared>) {
    let peer = conn.peer.clone();
    let read = tokio::time::timeout(
        shared.config.connect_timeout(),
        read_connect_request(&mut conn, &shared.config),
    )
    .await;

    let (request, buffer, backlog) = match read {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            tracing::debug!(peer = %peer, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            tracing::debug!(peer = %peer, "handshake timed out");
            return;
        }
    };

    let verifying_times = request.verifying_times;
    tracing::debug!(
        peer = %peer,
        session_id = %request.session_id,
        verifying_times,
        ack = request.ack,
        "connect request"
    );
    if let Route::Reject(conn) = shared.route(conn, buffer, backlog, request) {
        refuse(conn, verifying_times).await;
    }
}

/// Read until the first complete frame, which must be a CONNECT_REQUEST.
///
/// Frames that arrived in the same reads are returned as backlog for the
/// session link, along with the buffer holding any partial frame.
async fn read_connect_request(
    conn: &mut Connection,
    config: &SessionConfig,
) -> Result<(ConnectRequest, FrameBuffer, Vec<Decoded>)> {
    let mut buffer = FrameBuffer::with_limits(config.max_frame_size, config.max_corrupt_frames);
    let mut chunk = vec![0u8; HANDSHAKE_READ_SIZE];
    loop {
        let n = conn.reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(SessionError::ConnectionClosed);
        }
        let mut decoded = buffer.push(&chunk[..n])?.into_iter();
        match decoded.next() {
            None => continue,
            Some(Decoded::Frame(Frame::ConnectRequest(request))) => {
                return Ok((request, buffer, decoded.collect()));
            }
            Some(Decoded::Frame(other)) => {
                return Err(SessionError::MalformedFrame(format!(
                    "expected connect request, got {:?}",
                    other.message_type()
                )));
            }
            Some(Decoded::Corrupt(e)) => return Err(e),
        }
    }
}

async fn refuse(mut conn: Connection, verifying_times: i32) {
    let response = Frame::ConnectResponse(ConnectResponse {
        success: false,
        verifying_times,
        ack: 0,
    });
    if let Err(e) = conn.writer.write_all(&response.encode()).await {
        tracing::debug!(peer = %conn.peer, error = %e, "refusal not delivered");
        return;
    }
    let _ = conn.writer.shutdown().await;
    tracing::debug!(peer = %conn.peer, "connection refused");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, LoopbackNetwork};

    fn test_config() -> SessionConfig {
        SessionConfig {
            shards: 2,
            ..SessionConfig::default()
        }
    }

    fn connect_request(id: &str, verifying_times: i32, ack: u64) -> Frame {
        Frame::ConnectRequest(ConnectRequest {
            client_identity: 9,
            verifying_times,
            ack,
            session_id: id.to_string(),
        })
    }

    async fn read_response(conn: &mut Connection) -> ConnectResponse {
        let mut buffer = FrameBuffer::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = conn.reader.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before a response");
            for item in buffer.push(&chunk[..n]).unwrap() {
                if let Decoded::Frame(Frame::ConnectResponse(response)) = item {
                    return response;
                }
            }
        }
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let mut tombstones = Tombstones::new(2);
        tombstones.insert("a".into());
        tombstones.insert("b".into());
        tombstones.insert("a".into());
        assert!(tombstones.contains("a"));
        tombstones.insert("c".into());
        assert!(!tombstones.contains("a"));
        assert!(tombstones.contains("b"));
        assert!(tombstones.contains("c"));

        let mut disabled = Tombstones::new(0);
        disabled.insert("a".into());
        assert!(!disabled.contains("a"));
    }

    #[tokio::test]
    async fn test_new_session_accepted() {
        let net = LoopbackNetwork::new();
        let mut server = SessionServer::builder()
            .config(test_config())
            .bind(net.listen("srv"))
            .unwrap();
        assert_eq!(server.local_addr(), "loopback:srv");

        let mut conn = net.connector("srv").connect().await.unwrap();
        conn.writer.write_all(&connect_request("s1", 1, 0).encode()).await.unwrap();
        let response = read_response(&mut conn).await;
        assert!(response.success);
        assert_eq!(response.verifying_times, 1);
        assert_eq!(response.ack, 0);

        let session = server.accept().await.unwrap();
        assert_eq!(session.session_id(), "s1");
        assert_eq!(session.remote_identity(), 9);
        session.established().await.unwrap();
        assert!(server.session("s1").is_some());
        assert_eq!(server.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_with_ack_refused() {
        let net = LoopbackNetwork::new();
        let server = SessionServer::builder()
            .config(test_config())
            .bind(net.listen("srv"))
            .unwrap();

        let mut conn = net.connector("srv").connect().await.unwrap();
        conn.writer.write_all(&connect_request("lost", 3, 17).encode()).await.unwrap();
        let response = read_response(&mut conn).await;
        assert!(!response.success);
        assert_eq!(response.verifying_times, 3);
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn test_non_handshake_first_frame_dropped() {
        let net = LoopbackNetwork::new();
        let server = SessionServer::builder()
            .config(test_config())
            .bind(net.listen("srv"))
            .unwrap();

        let mut conn = net.connector("srv").connect().await.unwrap();
        let ping = Frame::data(1, 0, crate::protocol::SocketMessage::PingPong);
        conn.writer.write_all(&ping.encode()).await.unwrap();

        let mut chunk = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.reader.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_is_tombstoned() {
        let net = LoopbackNetwork::new();
        let mut server = SessionServer::builder()
            .config(test_config())
            .bind(net.listen("srv"))
            .unwrap();

        let mut conn = net.connector("srv").connect().await.unwrap();
        conn.writer.write_all(&connect_request("s1", 1, 0).encode()).await.unwrap();
        assert!(read_response(&mut conn).await.success);

        let session = server.accept().await.unwrap();
        session.close();
        assert_eq!(session.closed().await, crate::session::CloseReason::Local);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !server.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut retry = net.connector("srv").connect().await.unwrap();
        retry.writer.write_all(&connect_request("s1", 2, 0).encode()).await.unwrap();
        assert!(!read_response(&mut retry).await.success);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let net = LoopbackNetwork::new();
        let mut server = SessionServer::builder()
            .config(test_config())
            .bind(net.listen("srv"))
            .unwrap();

        let mut conn = net.connector("srv").connect().await.unwrap();
        conn.writer.write_all(&connect_request("s1", 1, 0).encode()).await.unwrap();
        assert!(read_response(&mut conn).await.success);
        let session = server.accept().await.unwrap();

        server.shutdown();
        assert_eq!(session.closed().await, crate::session::CloseReason::Shutdown);
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_handler_fails_bind() {
        let net = LoopbackNetwork::new();
        let result = SessionServer::builder()
            .handle(2, 1, |v: Value, _ctx| async move { Ok(v) })
            .handle(2, 1, |v: Value, _ctx| async move { Ok(v) })
            .bind(net.listen("srv"));
        assert!(matches!(result, Err(SessionError::DuplicateHandler { .. })));
    }
}
