//! Sessions: one logical peer connection that survives reconnects.
//!
//! A [`Session`] is a cheap, cloneable handle. The state it refers to lives
//! on a session worker (see [`ShardPool`]) and is only ever touched there;
//! every handle method posts a command to that worker.
//!
//! ```text
//!  handles ──Command──► worker (shard thread) ◄──LinkEvent── reader task
//!                         │         │
//!                         │         └──Inbound──► inbox task ─► handlers
//!                         └──frames──► writer task ─► transport
//! ```

mod actor;
mod link;
mod shard;
mod state;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) use actor::{Attach, Endpoint};
pub use shard::{ShardId, ShardPool};
pub use state::{CloseReason, SessionState, SessionStats};

use actor::{Actor, ActorParts, Command};
use crate::codec::{Value, WireCodec, WireType};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError, WireError};
use crate::protocol::SocketMessage;
use crate::rpc::{encode_outcome, HandlerResult, Invocation, Reply, RpcDispatcher, RpcFault};

/// Handle to a session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    id: Arc<str>,
    remote_identity: u64,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    shard: ShardId,
    codec: Arc<WireCodec>,
    rpc_timeout: Duration,
    max_frame_size: u32,
    _pool: Arc<ShardPool>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("remote_identity", &self.inner.remote_identity)
            .field("shard", &self.inner.shard)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything needed to start a session worker.
pub(crate) struct SessionSetup {
    pub id: String,
    pub remote_identity: u64,
    pub endpoint: Endpoint,
    pub config: Arc<SessionConfig>,
    pub codec: Arc<WireCodec>,
    pub dispatcher: Arc<RpcDispatcher>,
    pub pool: Arc<ShardPool>,
    pub runtime: Handle,
}

impl Session {
    /// Start a worker on the session's shard and its inbox on `runtime`.
    pub(crate) fn spawn(setup: SessionSetup, initial: Option<Attach>) -> Session {
        let SessionSetup {
            id,
            remote_identity,
            endpoint,
            config,
            codec,
            dispatcher,
            pool,
            runtime,
        } = setup;

        let id: Arc<str> = Arc::from(id);
        let shard = pool.shard_for(&id);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let session = Session {
            inner: Arc::new(Inner {
                id: id.clone(),
                remote_identity,
                commands: commands_tx,
                state: state_rx,
                shard,
                codec: codec.clone(),
                rpc_timeout: config.rpc_timeout(),
                max_frame_size: config.max_frame_size,
                _pool: pool.clone(),
            }),
        };

        dispatcher.spawn_inbox(session.clone(), inbox_rx, &runtime);
        let actor = Actor::new(ActorParts {
            id,
            endpoint,
            config,
            codec,
            runtime,
            state_tx,
            commands,
            inbox: inbox_tx,
        });
        pool.spawn(shard, actor.run(initial));
        session
    }

    pub fn session_id(&self) -> &str {
        &self.inner.id
    }

    /// Identity the peer announced in its handshake; 0 on the client side.
    pub fn remote_identity(&self) -> u64 {
        self.inner.remote_identity
    }

    /// The worker this session is pinned to.
    pub fn shard(&self) -> ShardId {
        self.inner.shard
    }

    pub fn codec(&self) -> &Arc<WireCodec> {
        &self.inner.codec
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Send a one-way message.
    ///
    /// Returns once the message is handed to the session worker. Overflowing
    /// the session's queues closes the session with [`CloseReason::Overflow`].
    /// A message too large for one frame fails with
    /// [`SessionError::FrameTooLarge`] and is not queued.
    pub fn send(&self, value: impl Into<Value>) -> Result<()> {
        let payload = self.inner.codec.encode(&value.into())?;
        SocketMessage::OneWay {
            payload: payload.clone(),
        }
        .check_frame_size(self.inner.max_frame_size)?;
        self.command(Command::Send { payload })
    }

    /// Send any serde value as a MESSAGE payload.
    pub fn send_message<T: Serialize>(&self, message: &T) -> Result<()> {
        self.send(Value::message(message)?)
    }

    /// Call a remote method with the default RPC timeout.
    pub async fn call(&self, service_id: u16, method_id: u16, args: impl Into<Value>) -> Result<Value> {
        self.call_with_timeout(service_id, method_id, args, self.inner.rpc_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        service_id: u16,
        method_id: u16,
        args: impl Into<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let payload = self.encode_request(service_id, method_id, args.into())?;
        let (tx, rx) = oneshot::channel();
        self.command(Command::Call {
            payload,
            is_sync: false,
            timeout,
            reply: Reply::Channel(tx),
        })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Call with serde request and response types carried as MESSAGE values.
    pub async fn call_typed<T, R>(&self, service_id: u16, method_id: u16, request: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let value = self.call(service_id, method_id, Value::message(request)?).await?;
        match value.decode_message() {
            Some(result) => result,
            None => Err(SessionError::Wire(WireError::TypeMismatch {
                expected: WireType::Message,
                found: value.wire_type(),
            })),
        }
    }

    /// Call and run `callback` with the outcome on the session's own worker.
    ///
    /// Callbacks of one session run in the order their responses arrived.
    pub fn call_then<F>(&self, service_id: u16, method_id: u16, args: impl Into<Value>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let payload = self.encode_request(service_id, method_id, args.into())?;
        self.command(Command::Call {
            payload,
            is_sync: false,
            timeout: self.inner.rpc_timeout,
            reply: Reply::Callback(Box::new(callback)),
        })
    }

    /// Call and block the current thread until the response or the timeout.
    ///
    /// Meant for plain threads (or `spawn_blocking`). Calling it from the
    /// session's own worker fails with [`SessionError::SelfDeadlock`]
    /// instead of hanging.
    pub fn call_blocking(&self, service_id: u16, method_id: u16, args: impl Into<Value>) -> Result<Value> {
        if ShardPool::current() == Some(self.inner.shard) {
            return Err(SessionError::SelfDeadlock);
        }
        let payload = self.encode_request(service_id, method_id, args.into())?;
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.command(Command::Call {
            payload,
            is_sync: true,
            timeout: self.inner.rpc_timeout,
            reply: Reply::Callback(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        })?;
        rx.recv().unwrap_or_else(|_| Err(self.closed_error()))
    }

    /// Run `task` on the session's own worker.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.command(Command::Execute(Box::new(task)))
    }

    /// Close the session. Calling it again, or on a closed session, does nothing.
    pub fn close(&self) {
        let _ = self.inner.commands.send(Command::Close(CloseReason::Local));
    }

    /// Wait until the session is closed and report why.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.inner.state.clone();
        loop {
            if let Some(reason) = state.borrow_and_update().close_reason() {
                return reason;
            }
            if state.changed().await.is_err() {
                return state.borrow().close_reason().unwrap_or(CloseReason::Shutdown);
            }
        }
    }

    /// Wait for the handshake to complete.
    pub async fn established(&self) -> Result<()> {
        let mut state = self.inner.state.clone();
        loop {
            let current = *state.borrow_and_update();
            match current {
                SessionState::Established => return Ok(()),
                SessionState::Closed(reason) => return Err(closed_to_error(reason)),
                SessionState::Connecting | SessionState::Reconnecting => {}
            }
            if state.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    /// Counters from the session worker.
    pub async fn stats(&self) -> Result<SessionStats> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Stats(tx))?;
        rx.await.map_err(|_| self.closed_error())
    }

    /// Close on behalf of the owning server.
    pub(crate) fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Close(CloseReason::Shutdown));
    }

    pub(crate) fn respond(&self, request_id: u64, outcome: HandlerResult) {
        let (mut result_code, mut payload) = encode_outcome(&self.inner.codec, &outcome);
        let response = SocketMessage::RpcResponse {
            request_id,
            result_code,
            payload: payload.clone(),
        };
        if let Err(e) = response.check_frame_size(self.inner.max_frame_size) {
            tracing::warn!(
                session_id = %self.inner.id,
                request_id,
                error = %e,
                "response too large, answering with an error"
            );
            let fault = RpcFault::handler_error("response exceeds the frame size limit");
            (result_code, payload) = encode_outcome(&self.inner.codec, &Err(fault));
        }
        let sent = self.command(Command::Respond {
            request_id,
            result_code,
            payload,
        });
        if sent.is_err() {
            tracing::debug!(session_id = %self.inner.id, request_id, "response dropped: session closed");
        }
    }

    pub(crate) fn attach(&self, attach: Attach) -> Result<()> {
        self.command(Command::Attach(attach))
    }

    fn encode_request(&self, service_id: u16, method_id: u16, args: Value) -> Result<Bytes> {
        let payload = Invocation::new(service_id, method_id, args).encode(&self.inner.codec)?;
        SocketMessage::RpcRequest {
            request_id: 0,
            is_sync: false,
            payload: payload.clone(),
        }
        .check_frame_size(self.inner.max_frame_size)?;
        Ok(payload)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Closed(self.state().close_reason().unwrap_or(CloseReason::Shutdown))
    }
}

fn closed_to_error(reason: CloseReason) -> SessionError {
    match reason {
        CloseReason::Rejected => SessionError::HandshakeRejected,
        CloseReason::ConnectFailed => {
            SessionError::ConnectFailed("reconnect attempts exhausted".to_string())
        }
        other => SessionError::Closed(other),
    }
}
