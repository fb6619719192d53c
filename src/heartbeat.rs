//! Liveness probing.
//!
//! Two policies:
//!
//! - **ping-pong** (default): the initiating side (client) probes after
//!   `ping_interval` of write silence; the responder (server) answers every
//!   PING with a PONG.
//! - **ping-ping**: both sides probe on their own schedule and nobody
//!   answers; ordinary traffic and the peer's probes keep the read clock
//!   fresh. Reacts faster to one-sided silence, at twice the idle traffic.
//!
//! Either way, read silence longer than `session_timeout` expires the
//! session.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatPolicy {
    #[default]
    PingPong,
    PingPing,
}

/// Which end of the session this monitor runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connecting side.
    Initiator,
    /// The accepting side.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendPing,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    policy: HeartbeatPolicy,
    role: Role,
    ping_interval: Duration,
    session_timeout: Duration,
    last_read: Instant,
    last_write: Instant,
}

impl Heartbeat {
    pub fn new(
        policy: HeartbeatPolicy,
        role: Role,
        ping_interval: Duration,
        session_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            policy,
            role,
            ping_interval,
            session_timeout,
            last_read: now,
            last_write: now,
        }
    }

    pub fn on_read(&mut self, now: Instant) {
        self.last_read = now;
    }

    pub fn on_write(&mut self, now: Instant) {
        self.last_write = now;
    }

    /// Restart both clocks, e.g. when a new link is attached.
    pub fn reset(&mut self, now: Instant) {
        self.last_read = now;
        self.last_write = now;
    }

    /// Whether this side sends probes on its own.
    pub fn probes(&self) -> bool {
        match self.policy {
            HeartbeatPolicy::PingPong => self.role == Role::Initiator,
            HeartbeatPolicy::PingPing => true,
        }
    }

    /// Whether an inbound PING must be answered.
    pub fn on_ping_received(&self) -> bool {
        self.policy == HeartbeatPolicy::PingPong && self.role == Role::Responder
    }

    pub fn poll(&self, now: Instant) -> HeartbeatAction {
        if now.saturating_duration_since(self.last_read) > self.session_timeout {
            return HeartbeatAction::Expired;
        }
        if self.probes() && now.saturating_duration_since(self.last_write) >= self.ping_interval {
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Idle
    }

    /// Earliest instant at which [`poll`](Self::poll) may change its answer.
    pub fn next_deadline(&self) -> Instant {
        let expiry = self.last_read + self.session_timeout + Duration::from_millis(1);
        if self.probes() {
            expiry.min(self.last_write + self.ping_interval)
        } else {
            expiry
        }
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);
    const TIMEOUT: Duration = Duration::from_millis(300);

    fn monitor(policy: HeartbeatPolicy, role: Role, now: Instant) -> Heartbeat {
        Heartbeat::new(policy, role, INTERVAL, TIMEOUT, now)
    }

    #[test]
    fn test_ping_pong_roles() {
        let now = Instant::now();
        let client = monitor(HeartbeatPolicy::PingPong, Role::Initiator, now);
        let server = monitor(HeartbeatPolicy::PingPong, Role::Responder, now);

        assert!(client.probes());
        assert!(!client.on_ping_received());
        assert!(!server.probes());
        assert!(server.on_ping_received());

        assert_eq!(client.poll(now + INTERVAL), HeartbeatAction::SendPing);
        assert_eq!(server.poll(now + INTERVAL), HeartbeatAction::Idle);
    }

    #[test]
    fn test_ping_ping_both_probe_nobody_answers() {
        let now = Instant::now();
        for role in [Role::Initiator, Role::Responder] {
            let hb = monitor(HeartbeatPolicy::PingPing, role, now);
            assert!(hb.probes());
            assert!(!hb.on_ping_received());
            assert_eq!(hb.poll(now + INTERVAL), HeartbeatAction::SendPing);
        }
    }

    #[test]
    fn test_write_resets_probe_clock() {
        let now = Instant::now();
        let mut hb = monitor(HeartbeatPolicy::PingPong, Role::Initiator, now);
        hb.on_write(now + Duration::from_millis(80));
        assert_eq!(hb.poll(now + INTERVAL), HeartbeatAction::Idle);
        assert_eq!(hb.next_deadline(), now + Duration::from_millis(180));
    }

    #[test]
    fn test_read_silence_expires() {
        let now = Instant::now();
        let mut hb = monitor(HeartbeatPolicy::PingPong, Role::Responder, now);
        assert_eq!(hb.poll(now + TIMEOUT), HeartbeatAction::Idle);
        assert_eq!(
            hb.poll(now + TIMEOUT + Duration::from_millis(1)),
            HeartbeatAction::Expired
        );
        hb.on_read(now + TIMEOUT);
        assert_eq!(
            hb.poll(now + TIMEOUT + Duration::from_millis(1)),
            HeartbeatAction::Idle
        );
    }

    #[test]
    fn test_policy_from_config_names() {
        let policy: HeartbeatPolicy = serde_json::from_str("\"ping_ping\"").unwrap();
        assert_eq!(policy, HeartbeatPolicy::PingPing);
        assert_eq!(HeartbeatPolicy::default(), HeartbeatPolicy::PingPong);
    }
}
