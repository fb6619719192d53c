//! Error types for sessionwire.

use thiserror::Error;

use crate::codec::WireType;
use crate::session::CloseReason;

/// Errors raised by the value codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A tag byte that does not name any wire type.
    #[error("unknown wire tag: {0}")]
    UnknownTag(u8),

    /// Decoded tag does not match the tag expected at this position.
    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: WireType, found: WireType },

    /// Input ended before the value was complete.
    #[error("truncated input: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// A length or count prefix is out of range.
    #[error("invalid length prefix {length} (limit {limit})")]
    InvalidLength { length: u64, limit: usize },

    /// A varint ran past 10 bytes or overflowed its target width.
    #[error("varint overflow")]
    VarintOverflow,

    /// String bytes are not valid UTF-8.
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    /// A CHAR value is not a Unicode scalar value.
    #[error("invalid char code point: {0:#x}")]
    InvalidChar(u32),

    /// A BOOLEAN byte other than 0 or 1.
    #[error("invalid boolean byte: {0}")]
    InvalidBool(u8),

    /// Entity type id with no registered descriptor.
    #[error("unknown entity type id: {0}")]
    UnknownEntity(u32),

    /// Entity value does not fit its descriptor.
    #[error("entity {type_id} layout error: {reason}")]
    EntityLayout { type_id: u32, reason: String },

    /// Nested entities deeper than the codec allows.
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    /// Bytes left over after a complete value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Registry misuse at startup.
    #[error("registry error: {0}")]
    Registry(String),
}

/// Main error type for sessions, frames and RPC.
#[derive(Debug, Error)]
pub enum SessionError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Value codec error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Frame checksum did not match its contents.
    #[error("frame checksum mismatch: expected {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch { expected: u64, computed: u64 },

    /// Frame length prefix outside the legal range; the stream cannot be realigned.
    #[error("malformed frame length {length} (min {min}, max {max})")]
    MalformedLength { length: u32, min: u32, max: u32 },

    /// Outbound message would not fit in one frame.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: u32 },

    /// Message type byte that names no frame kind.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Frame body shorter or longer than its header implies.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Peer acknowledged a sequence outside the legal window.
    #[error("ack {ack} outside [{lower}, {upper}]")]
    AckOutOfRange { ack: u64, lower: u64, upper: u64 },

    /// Peer skipped sequence numbers.
    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    /// Handshake with an outdated attempt counter.
    #[error("stale handshake: verifying_times {received} <= {current}")]
    StaleHandshake { received: i32, current: i32 },

    /// Pending or cache queue exceeded its configured limit.
    #[error("{queue} queue overflow (limit {limit})")]
    QueueOverflow { queue: &'static str, limit: usize },

    /// Peer refused the handshake.
    #[error("handshake rejected by peer")]
    HandshakeRejected,

    /// No handshake response arrived in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Could not establish a physical connection.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Session is closed.
    #[error("session closed: {0}")]
    Closed(CloseReason),

    /// RPC call deadline expired.
    #[error("RPC call timed out")]
    Timeout,

    /// Remote handler reported a failure.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// Blocking call issued from the worker that would have to complete it.
    #[error("blocking call on the session's own worker would deadlock")]
    SelfDeadlock,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A handler is already registered for this method key.
    #[error("handler already registered for service {service_id} method {method_id}")]
    DuplicateHandler { service_id: u16, method_id: u16 },

    /// Internal channel or transport closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,
}

impl SessionError {
    /// Frame-level corruption: bad checksum, unknown tags, malformed bodies.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SessionError::ChecksumMismatch { .. }
                | SessionError::MalformedLength { .. }
                | SessionError::UnknownMessageType(_)
                | SessionError::MalformedFrame(_)
                | SessionError::Wire(_)
        )
    }

    /// Protocol desynchronisation: fatal to the physical connection only.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            SessionError::AckOutOfRange { .. }
                | SessionError::SequenceGap { .. }
                | SessionError::StaleHandshake { .. }
        )
    }

    /// Errors that end the whole session rather than one connection.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            SessionError::QueueOverflow { .. }
                | SessionError::HandshakeRejected
                | SessionError::Closed(_)
        )
    }
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let corrupt = SessionError::ChecksumMismatch {
            expected: 1,
            computed: 2,
        };
        assert!(corrupt.is_corruption());
        assert!(!corrupt.is_desync());

        let desync = SessionError::AckOutOfRange {
            ack: 10,
            lower: 1,
            upper: 5,
        };
        assert!(desync.is_desync());
        assert!(!desync.is_fatal_to_session());

        let overflow = SessionError::QueueOverflow {
            queue: "cache",
            limit: 4,
        };
        assert!(overflow.is_fatal_to_session());
        assert!(!overflow.is_corruption());
    }

    #[test]
    fn test_wire_error_converts() {
        let err: SessionError = WireError::UnknownTag(99).into();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("unknown wire tag: 99"));
    }
}
