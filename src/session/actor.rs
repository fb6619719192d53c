//! The session worker.
//!
//! One actor per session runs on the session's shard and owns every piece
//! of mutable session state: the message queue, the outstanding calls, the
//! heartbeat clocks, the handshake counter and the current link. Handles,
//! link tasks and handlers reach it only through channels.
//!
//! Each inbound event goes through the same fixed stages: frame decode (on
//! the link task), then ack update, then sequencing, then dispatch to the
//! pending-call table or the session's inbox.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use super::link::{Link, LinkEvent};
use super::state::{CloseReason, SessionState, SessionStats};
use crate::codec::{Value, WireCodec};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::heartbeat::{Heartbeat, HeartbeatAction, Role};
use crate::protocol::{ConnectRequest, ConnectResponse, Decoded, Frame, FrameBuffer, SocketMessage};
use crate::queue::{MessageQueue, QueuedMessage, Received};
use crate::rpc::{decode_outcome, next_request_id, Inbound, Invocation, PendingCalls, Reply, BAD_REQUEST};
use crate::transport::{Connection, Connector};

/// Link events buffered between a reader task and the worker.
pub(crate) const LINK_EVENT_CAPACITY: usize = 1024;

/// Retry interval for frames waiting on a saturated writer.
const FLUSH_INTERVAL: Duration = Duration::from_millis(2);

const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Requests from handles and the server.
pub(crate) enum Command {
    Send {
        payload: Bytes,
    },
    Call {
        payload: Bytes,
        is_sync: bool,
        timeout: Duration,
        reply: Reply,
    },
    Respond {
        request_id: u64,
        result_code: i32,
        payload: Option<Bytes>,
    },
    Execute(Box<dyn FnOnce() + Send + 'static>),
    Stats(oneshot::Sender<SessionStats>),
    Attach(Attach),
    Close(CloseReason),
}

/// A server-side connection whose CONNECT_REQUEST names this session.
pub(crate) struct Attach {
    pub conn: Connection,
    pub buffer: FrameBuffer,
    pub backlog: Vec<Decoded>,
    pub request: ConnectRequest,
}

/// Which side of the session this worker plays.
pub(crate) enum Endpoint {
    Client {
        connector: Arc<dyn Connector>,
        client_identity: u64,
    },
    Server,
}

pub(crate) struct Actor {
    id: Arc<str>,
    endpoint: Endpoint,
    config: Arc<SessionConfig>,
    codec: Arc<WireCodec>,
    runtime: Handle,

    queue: MessageQueue,
    calls: PendingCalls,
    heartbeat: Heartbeat,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,

    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::Sender<LinkEvent>,
    events: mpsc::Receiver<LinkEvent>,
    inbox: mpsc::UnboundedSender<Inbound>,

    link: Option<Link>,
    generation: u64,
    verifying_times: i32,
    /// Client: a connect attempt is in flight (dialing or awaiting the response).
    attempting: bool,
    attempt_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    failed_attempts: u32,
    protocol_failures: u32,

    last_sent_ack: u64,
    ack_due: Option<Instant>,
    corrupt_frames: u64,
    reconnects: u64,
    established_once: bool,
}

/// Channels and shared parts an actor is built from.
pub(crate) struct ActorParts {
    pub id: Arc<str>,
    pub endpoint: Endpoint,
    pub config: Arc<SessionConfig>,
    pub codec: Arc<WireCodec>,
    pub runtime: Handle,
    pub state_tx: watch::Sender<SessionState>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub inbox: mpsc::UnboundedSender<Inbound>,
}

impl Actor {
    pub(crate) fn new(parts: ActorParts) -> Self {
        let ActorParts {
            id,
            endpoint,
            config,
            codec,
            runtime,
            state_tx,
            commands,
            inbox,
        } = parts;
        let role = match endpoint {
            Endpoint::Client { .. } => Role::Initiator,
            Endpoint::Server => Role::Responder,
        };
        let heartbeat = Heartbeat::new(
            config.heartbeat,
            role,
            config.ping_interval(),
            config.session_timeout(),
            Instant::now(),
        );
        let (events_tx, events) = mpsc::channel(LINK_EVENT_CAPACITY);
        Self {
            id,
            queue: MessageQueue::new(config.max_pending_messages, config.max_cache_messages),
            calls: PendingCalls::new(),
            heartbeat,
            state: SessionState::Connecting,
            state_tx,
            commands,
            events_tx,
            events,
            inbox,
            link: None,
            generation: 0,
            verifying_times: 0,
            attempting: false,
            attempt_deadline: None,
            reconnect_at: None,
            failed_attempts: 0,
            protocol_failures: 0,
            last_sent_ack: 0,
            ack_due: None,
            corrupt_frames: 0,
            reconnects: 0,
            established_once: false,
            endpoint,
            config,
            codec,
            runtime,
        }
    }

    pub(crate) async fn run(mut self, initial: Option<Attach>) {
        match initial {
            Some(attach) => self.on_attach(attach),
            None => self.start_attempt(),
        }

        while !self.state.is_closed() {
            let wake = self.next_wake(Instant::now());
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => self.close(CloseReason::Shutdown),
                },
                Some(event) = self.events.recv() => self.on_link_event(event),
                _ = sleep_until(wake) => self.on_timer(Instant::now()),
            }
            if !self.state.is_closed() {
                self.after_event(Instant::now());
            }
        }
        tracing::trace!(session_id = %self.id, "session worker stopped");
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { payload } => self.submit(SocketMessage::OneWay { payload }),
            Command::Call {
                payload,
                is_sync,
                timeout,
                reply,
            } => {
                let request_id = next_request_id();
                self.calls.insert(request_id, Instant::now() + timeout, reply);
                tracing::trace!(session_id = %self.id, request_id, "call queued");
                self.submit(SocketMessage::RpcRequest {
                    request_id,
                    is_sync,
                    payload,
                });
            }
            Command::Respond {
                request_id,
                result_code,
                payload,
            } => self.submit(SocketMessage::RpcResponse {
                request_id,
                result_code,
                payload,
            }),
            Command::Execute(task) => task(),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Attach(attach) => self.on_attach(attach),
            Command::Close(reason) => self.close(reason),
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state,
            sequencer: self.queue.sequencer(),
            ack: self.queue.ack(),
            pending: self.queue.pending_len(),
            cached: self.queue.cache_len(),
            duplicates: self.queue.duplicates(),
            corrupt_frames: self.corrupt_frames,
            reconnects: self.reconnects,
            pending_calls: self.calls.len(),
        }
    }

    /// Sequence a payload-bearing message and send or cache it.
    fn submit(&mut self, message: SocketMessage) {
        let writable =
            self.state.is_established() && self.link.as_ref().is_some_and(Link::is_writable);
        match self.queue.enqueue(message, writable) {
            Ok(Some(queued)) => self.write_queued(queued),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "outbound queue overflow");
                self.close(CloseReason::Overflow);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Writing
    // ---------------------------------------------------------------------

    fn write_queued(&mut self, queued: QueuedMessage) {
        let frame = Frame::data(queued.seq, self.queue.ack(), queued.message);
        self.write_frame(&frame);
    }

    fn send_ping(&mut self) {
        let frame = Frame::data(self.queue.sequencer(), self.queue.ack(), SocketMessage::PingPong);
        tracing::debug!(
            session_id = %self.id,
            sequence = self.queue.sequencer(),
            ack = self.queue.ack(),
            "ping sent"
        );
        self.write_frame(&frame);
    }

    fn write_frame(&mut self, frame: &Frame) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(e) = link.write(frame.encode()) {
            self.link_lost(Some(e));
            return;
        }
        self.heartbeat.on_write(Instant::now());
        if let Frame::Data { ack, .. } = frame {
            self.last_sent_ack = *ack;
            if self.last_sent_ack == self.queue.ack() {
                self.ack_due = None;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Link events
    // ---------------------------------------------------------------------

    fn on_link_event(&mut self, event: LinkEvent) {
        if event.generation() != self.generation {
            tracing::trace!(session_id = %self.id, generation = event.generation(), "stale link event");
            return;
        }
        match event {
            LinkEvent::Opened { conn, .. } => self.on_opened(conn),
            LinkEvent::Failed { error, .. } => self.attempt_failed(error),
            LinkEvent::Frame { frame, .. } => {
                self.heartbeat.on_read(Instant::now());
                self.on_frame(frame);
            }
            LinkEvent::Corrupt { error, .. } => {
                self.corrupt_frames += 1;
                tracing::warn!(session_id = %self.id, error = %error, "corrupt frame discarded");
            }
            LinkEvent::Closed { error, .. } => {
                if let Some(e) = &error {
                    if e.is_corruption() {
                        self.corrupt_frames += 1;
                        self.protocol_failures += 1;
                    }
                }
                self.link_lost(error);
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::ConnectResponse(response) => self.on_connect_response(response),
            Frame::ConnectRequest(request) => {
                tracing::warn!(
                    session_id = %self.id,
                    verifying_times = request.verifying_times,
                    "handshake on an attached link ignored"
                );
            }
            Frame::Data { seq, ack, message } => {
                if !self.state.is_established() {
                    tracing::debug!(session_id = %self.id, sequence = seq, "data before handshake dropped");
                    return;
                }
                if let Err(e) = self.on_data(seq, ack, message) {
                    self.protocol_error(e);
                }
            }
        }
    }

    /// Ack update, sequencing, then dispatch.
    fn on_data(&mut self, seq: u64, ack: u64, message: SocketMessage) -> Result<()> {
        let trimmed = self.queue.on_ack_received(ack)?;
        if trimmed > 0 {
            tracing::trace!(session_id = %self.id, ack, trimmed, "pending trimmed");
        }

        if !message.message_type().is_sequenced() {
            if self.heartbeat.on_ping_received() {
                self.send_ping();
            }
            return Ok(());
        }

        if self.queue.on_receive(seq)? == Received::Duplicate {
            tracing::debug!(session_id = %self.id, sequence = seq, "duplicate sequence dropped");
            return Ok(());
        }
        self.protocol_failures = 0;
        if self.ack_due.is_none() {
            self.ack_due = Some(Instant::now() + self.config.ack_timeout());
        }

        match message {
            SocketMessage::OneWay { payload } => match self.codec.decode(&payload) {
                Ok(value) => self.to_inbox(Inbound::Message(value)),
                Err(e) => {
                    tracing::warn!(session_id = %self.id, sequence = seq, error = %e, "undecodable one-way message dropped");
                }
            },
            SocketMessage::RpcRequest {
                request_id,
                is_sync,
                payload,
            } => match Invocation::decode(&self.codec, &payload) {
                Ok(invocation) => self.to_inbox(Inbound::Request {
                    request_id,
                    is_sync,
                    invocation,
                }),
                Err(e) => {
                    tracing::warn!(session_id = %self.id, request_id, error = %e, "bad request");
                    let payload = self.codec.encode(&Value::String(e.to_string())).ok();
                    self.submit(SocketMessage::RpcResponse {
                        request_id,
                        result_code: BAD_REQUEST,
                        payload,
                    });
                }
            },
            SocketMessage::RpcResponse {
                request_id,
                result_code,
                payload,
            } => {
                let result = decode_outcome(&self.codec, result_code, payload.as_deref());
                if !self.calls.complete(request_id, result) {
                    tracing::warn!(session_id = %self.id, request_id, "late or unknown RPC response dropped");
                }
            }
            SocketMessage::PingPong => {}
        }
        Ok(())
    }

    fn to_inbox(&mut self, item: Inbound) {
        if self.inbox.send(item).is_err() {
            tracing::debug!(session_id = %self.id, "inbox closed, message dropped");
        }
    }

    fn protocol_error(&mut self, error: SessionError) {
        self.protocol_failures += 1;
        tracing::warn!(
            session_id = %self.id,
            error = %error,
            failures = self.protocol_failures,
            "protocol desync, dropping link"
        );
        if self.protocol_failures > self.config.max_connect_try_times {
            self.close(CloseReason::Corruption);
        } else {
            self.link_lost(Some(error));
        }
    }

    /// The current link is gone.
    fn link_lost(&mut self, error: Option<SessionError>) {
        let peer = self.link.as_ref().map(|l| l.peer().to_string());
        self.link = None;
        self.generation += 1;

        if self.protocol_failures > self.config.max_connect_try_times {
            self.close(CloseReason::Corruption);
            return;
        }

        if self.attempting {
            self.attempt_failed(error.unwrap_or(SessionError::ConnectionClosed));
            return;
        }

        if self.state.is_established() {
            tracing::info!(
                session_id = %self.id,
                peer = peer.as_deref().unwrap_or("-"),
                error = error.as_ref().map(|e| e.to_string()).as_deref().unwrap_or("eof"),
                "link lost, session reconnecting"
            );
            self.set_state(SessionState::Reconnecting);
            if matches!(self.endpoint, Endpoint::Client { .. }) {
                self.reconnect_at = Some(Instant::now());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Handshake: client side
    // ---------------------------------------------------------------------

    fn start_attempt(&mut self) {
        let Endpoint::Client { connector, .. } = &self.endpoint else {
            return;
        };
        let connector = connector.clone();
        self.generation += 1;
        self.verifying_times = self.verifying_times.wrapping_add(1).max(1);
        self.attempting = true;
        self.attempt_deadline = Some(Instant::now() + self.config.connect_timeout());
        self.reconnect_at = None;

        let generation = self.generation;
        let events = self.events_tx.clone();
        tracing::debug!(
            session_id = %self.id,
            verifying_times = self.verifying_times,
            attempt = self.failed_attempts + 1,
            "connecting"
        );
        let timeout = self.config.connect_timeout();
        self.runtime.spawn(async move {
            let event = match tokio::time::timeout(timeout, connector.connect()).await {
                Ok(Ok(conn)) => LinkEvent::Opened { generation, conn },
                Ok(Err(error)) => LinkEvent::Failed { generation, error },
                Err(_) => LinkEvent::Failed {
                    generation,
                    error: SessionError::ConnectFailed("connect timed out".to_string()),
                },
            };
            let _ = events.send(event).await;
        });
    }

    fn on_opened(&mut self, conn: Connection) {
        let Endpoint::Client {
            client_identity, ..
        } = &self.endpoint
        else {
            return;
        };
        let request = ConnectRequest {
            client_identity: *client_identity,
            verifying_times: self.verifying_times,
            ack: self.queue.ack(),
            session_id: self.id.to_string(),
        };
        let buffer =
            FrameBuffer::with_limits(self.config.max_frame_size, self.config.max_corrupt_frames);
        self.attach_link(conn, buffer, Vec::new());
        self.write_frame(&Frame::ConnectRequest(request));
    }

    fn on_connect_response(&mut self, response: ConnectResponse) {
        let is_client = matches!(self.endpoint, Endpoint::Client { .. });
        if !is_client || !self.attempting || response.verifying_times != self.verifying_times {
            tracing::debug!(
                session_id = %self.id,
                verifying_times = response.verifying_times,
                current = self.verifying_times,
                "stale handshake response discarded"
            );
            return;
        }
        self.attempting = false;
        self.attempt_deadline = None;

        if !response.success {
            tracing::warn!(session_id = %self.id, "handshake rejected by server");
            self.close(CloseReason::Rejected);
            return;
        }
        if let Err(e) = self.queue.on_ack_received(response.ack) {
            tracing::error!(session_id = %self.id, error = %e, "handshake ack out of range");
            self.close(CloseReason::Corruption);
            return;
        }
        self.failed_attempts = 0;
        self.established();
    }

    fn attempt_failed(&mut self, error: SessionError) {
        self.attempting = false;
        self.attempt_deadline = None;
        self.link = None;
        self.generation += 1;
        self.failed_attempts += 1;

        tracing::warn!(
            session_id = %self.id,
            attempt = self.failed_attempts,
            max = self.config.max_connect_try_times,
            error = %error,
            "connect attempt failed"
        );
        if matches!(error, SessionError::HandshakeRejected) {
            self.close(CloseReason::Rejected);
        } else if self.failed_attempts >= self.config.max_connect_try_times {
            self.close(CloseReason::ConnectFailed);
        } else {
            if self.state.is_established() {
                self.set_state(SessionState::Reconnecting);
            }
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_interval());
        }
    }

    // ---------------------------------------------------------------------
    // Handshake: server side
    // ---------------------------------------------------------------------

    fn on_attach(&mut self, attach: Attach) {
        let Attach {
            conn,
            buffer,
            backlog,
            request,
        } = attach;

        if matches!(self.endpoint, Endpoint::Client { .. }) {
            return;
        }
        if let Err(e) = request.check_fresh(self.verifying_times) {
            tracing::debug!(session_id = %self.id, error = %e, "connection dropped");
            return;
        }
        self.verifying_times = request.verifying_times;
        self.link = None;
        self.generation += 1;
        self.attach_link(conn, buffer, backlog);

        if let Err(e) = self.queue.on_ack_received(request.ack) {
            tracing::error!(session_id = %self.id, error = %e, "handshake ack out of range");
            self.write_frame(&Frame::ConnectResponse(ConnectResponse {
                success: false,
                verifying_times: request.verifying_times,
                ack: 0,
            }));
            self.close(CloseReason::Corruption);
            return;
        }
        self.write_frame(&Frame::ConnectResponse(ConnectResponse {
            success: true,
            verifying_times: request.verifying_times,
            ack: self.queue.ack(),
        }));
        self.established();
    }

    fn attach_link(&mut self, conn: Connection, buffer: FrameBuffer, backlog: Vec<Decoded>) {
        let link = Link::start(
            self.generation,
            conn,
            buffer,
            backlog,
            self.events_tx.clone(),
            &self.runtime,
            &self.config.writer,
        );
        tracing::debug!(
            session_id = %self.id,
            peer = link.peer(),
            generation = link.generation(),
            verifying_times = self.verifying_times,
            "link attached"
        );
        self.heartbeat.reset(Instant::now());
        self.link = Some(link);
    }

    /// Handshake done: resend everything unacknowledged, then the cache.
    fn established(&mut self) {
        if self.established_once {
            self.reconnects += 1;
        }
        self.established_once = true;
        self.heartbeat.reset(Instant::now());
        self.set_state(SessionState::Established);
        tracing::info!(
            session_id = %self.id,
            sequence = self.queue.sequencer(),
            ack = self.queue.ack(),
            pending = self.queue.pending_len(),
            cached = self.queue.cache_len(),
            "session established"
        );

        match self.queue.resend_batch() {
            Ok(batch) => {
                for queued in batch {
                    self.write_queued(queued);
                }
            }
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "resend overflow");
                self.close(CloseReason::Overflow);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    fn next_wake(&mut self, now: Instant) -> Instant {
        let mut wake = now + IDLE_WAKE;
        let mut consider = |at: Option<Instant>| {
            if let Some(at) = at {
                wake = wake.min(at);
            }
        };

        consider(self.calls.next_deadline());
        consider(self.attempt_deadline);
        consider(self.reconnect_at);
        match self.state {
            SessionState::Established => {
                consider(Some(self.heartbeat.next_deadline()));
                consider(self.ack_due);
                let backlog = self.link.as_ref().is_some_and(Link::has_backlog);
                if backlog || self.queue.cache_len() > 0 {
                    consider(Some(now + FLUSH_INTERVAL));
                }
            }
            SessionState::Reconnecting => {
                consider(Some(self.expiry()));
            }
            SessionState::Connecting | SessionState::Closed(_) => {}
        }
        wake
    }

    fn expiry(&self) -> Instant {
        self.heartbeat.last_read() + self.config.session_timeout() + Duration::from_millis(1)
    }

    fn on_timer(&mut self, now: Instant) {
        let expired = self.calls.expire(now);
        if expired > 0 {
            tracing::debug!(session_id = %self.id, expired, "RPC calls timed out");
        }

        if self.attempt_deadline.is_some_and(|at| at <= now) {
            self.attempt_failed(SessionError::HandshakeTimeout);
        }
        if self.state.is_closed() {
            return;
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.start_attempt();
        }

        match self.state {
            SessionState::Established => match self.heartbeat.poll(now) {
                HeartbeatAction::Expired => self.expire_session(),
                HeartbeatAction::SendPing => self.send_ping(),
                HeartbeatAction::Idle => {}
            },
            SessionState::Reconnecting if now >= self.expiry() => self.expire_session(),
            _ => {}
        }
        if self.state.is_closed() {
            return;
        }

        if self.ack_due.is_some_and(|at| at <= now) {
            self.ack_due = None;
            if self.state.is_established() && self.queue.ack() != self.last_sent_ack {
                self.send_ping();
            }
        }
    }

    fn expire_session(&mut self) {
        tracing::warn!(
            session_id = %self.id,
            timeout_ms = self.config.session_timeout_ms,
            "read silence exceeded session timeout"
        );
        self.close(CloseReason::Timeout);
    }

    /// Drain the outbox and promote cached messages while the link accepts them.
    fn after_event(&mut self, now: Instant) {
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.flush() {
                self.link_lost(Some(e));
            }
        }

        let writable = self.state.is_established() && self.link.as_ref().is_some_and(Link::is_writable);
        if writable && self.queue.cache_len() > 0 {
            match self.queue.promote() {
                Ok(batch) => {
                    for queued in batch {
                        self.write_queued(queued);
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "pending queue overflow");
                    self.close(CloseReason::Overflow);
                    return;
                }
            }
        }

        if self.queue.ack() != self.last_sent_ack && self.ack_due.is_none() {
            self.ack_due = Some(now + self.config.ack_timeout());
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Idempotent. Releases queues and fails outstanding calls.
    fn close(&mut self, reason: CloseReason) {
        if self.state.is_closed() {
            return;
        }
        match reason {
            CloseReason::Local | CloseReason::Shutdown => {
                tracing::info!(session_id = %self.id, reason = %reason, "session closed");
            }
            _ => tracing::error!(session_id = %self.id, reason = %reason, "session closed"),
        }
        self.link = None;
        self.generation += 1;
        self.attempting = false;
        self.attempt_deadline = None;
        self.reconnect_at = None;
        self.ack_due = None;
        self.queue.clear();
        self.calls.fail_all(|| SessionError::Closed(reason));
        self.set_state(SessionState::Closed(reason));
    }
}
