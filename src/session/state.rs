//! Session lifecycle states.

use std::fmt;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,
    /// Nothing was read for longer than the session timeout.
    Timeout,
    /// A pending or cache queue overflowed.
    Overflow,
    /// Every reconnect attempt failed.
    ConnectFailed,
    /// The peer refused the handshake.
    Rejected,
    /// Repeated corruption or protocol desync.
    Corruption,
    /// The owning client, server or worker pool went away.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Local => "closed locally",
            CloseReason::Timeout => "session timed out",
            CloseReason::Overflow => "queue overflow",
            CloseReason::ConnectFailed => "reconnect attempts exhausted",
            CloseReason::Rejected => "handshake rejected",
            CloseReason::Corruption => "corrupt or desynchronised stream",
            CloseReason::Shutdown => "shut down",
        };
        f.write_str(text)
    }
}

/// `CONNECTING -> ESTABLISHED -> (RECONNECTING <-> ESTABLISHED)* -> CLOSED`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Established,
    Reconnecting,
    Closed(CloseReason),
}

impl SessionState {
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Established)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SessionState::Closed(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => f.write_str("CONNECTING"),
            SessionState::Established => f.write_str("ESTABLISHED"),
            SessionState::Reconnecting => f.write_str("RECONNECTING"),
            SessionState::Closed(reason) => write!(f, "CLOSED ({reason})"),
        }
    }
}

/// Snapshot of a session's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    pub sequencer: u64,
    pub ack: u64,
    pub pending: usize,
    pub cached: usize,
    /// Inbound frames dropped as already delivered.
    pub duplicates: u64,
    pub corrupt_frames: u64,
    /// Links attached after the first one.
    pub reconnects: u64,
    pub pending_calls: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_helpers() {
        let closed = SessionState::Closed(CloseReason::Overflow);
        assert!(closed.is_closed());
        assert_eq!(closed.close_reason(), Some(CloseReason::Overflow));
        assert!(SessionState::Established.is_established());
        assert_eq!(SessionState::Reconnecting.close_reason(), None);
        assert_eq!(closed.to_string(), "CLOSED (queue overflow)");
    }
}
