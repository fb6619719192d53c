//! Frame layout, message types and checksum.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────┬─────────────────┬─────────┐
//! │ Total length │ Checksum     │ Msg type │ Type header     │ Payload │
//! │ 4 bytes      │ 8 bytes      │ 1 byte   │ see MessageType │ rest    │
//! │ uint32 BE    │ uint64 BE    │          │                 │         │
//! └──────────────┴──────────────┴──────────┴─────────────────┴─────────┘
//! ```
//!
//! The total length counts the whole frame, length field included. The
//! checksum is CRC-32C over the length field followed by every byte after
//! the checksum field, zero-extended into the 64-bit slot.
//!
//! All multi-byte integers are Big Endian.

use crate::error::{Result, SessionError};

/// Size of the total-length field.
pub const LENGTH_SIZE: usize = 4;

/// Size of the checksum field.
pub const CHECKSUM_SIZE: usize = 8;

/// Length, checksum and message type: the part every frame starts with.
pub const PREFIX_SIZE: usize = LENGTH_SIZE + CHECKSUM_SIZE + 1;

/// Smallest legal total length.
pub const MIN_FRAME_SIZE: u32 = PREFIX_SIZE as u32;

/// Default largest total length (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Header sizes after the message type byte.
pub const CONNECT_RESPONSE_HEADER_SIZE: usize = 1 + 4 + 8;
pub const RPC_REQUEST_HEADER_SIZE: usize = 8 + 8 + 8 + 1;
pub const RPC_RESPONSE_HEADER_SIZE: usize = 8 + 8 + 8 + 4;
pub const ONE_WAY_HEADER_SIZE: usize = 8 + 8;
pub const PING_PONG_HEADER_SIZE: usize = 8 + 8;

/// Frame kind carried in the message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// `client_identity:u64 verifying_times:i32 ack:u64 session_id:STRING`
    ConnectRequest = 1,
    /// `success:u8 verifying_times:i32 ack:u64`
    ConnectResponse = 2,
    /// `seq:u64 ack:u64 request_id:u64 is_sync:u8` + payload
    RpcRequest = 3,
    /// `seq:u64 ack:u64 request_id:u64 result_code:i32` + optional payload
    RpcResponse = 4,
    /// `seq:u64 ack:u64` + payload
    OneWay = 5,
    /// `seq:u64 ack:u64`
    PingPong = 6,
}

impl MessageType {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(MessageType::ConnectRequest),
            2 => Ok(MessageType::ConnectResponse),
            3 => Ok(MessageType::RpcRequest),
            4 => Ok(MessageType::RpcResponse),
            5 => Ok(MessageType::OneWay),
            6 => Ok(MessageType::PingPong),
            other => Err(SessionError::UnknownMessageType(other)),
        }
    }

    /// Frames that consume a sequence number and enter the message queue.
    #[inline]
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            MessageType::RpcRequest | MessageType::RpcResponse | MessageType::OneWay
        )
    }
}

/// Compute the checksum of a complete frame.
///
/// The checksum slot itself (bytes 4..12) is skipped.
///
/// # Panics
///
/// Debug-asserts that `frame` holds at least [`PREFIX_SIZE`] bytes.
pub fn frame_checksum(frame: &[u8]) -> u64 {
    debug_assert!(frame.len() >= PREFIX_SIZE);
    let crc = crc32c::crc32c(&frame[..LENGTH_SIZE]);
    u64::from(crc32c::crc32c_append(crc, &frame[LENGTH_SIZE + CHECKSUM_SIZE..]))
}

/// Read the checksum stored in a frame.
#[inline]
pub fn stored_checksum(frame: &[u8]) -> u64 {
    let mut slot = [0u8; CHECKSUM_SIZE];
    slot.copy_from_slice(&frame[LENGTH_SIZE..LENGTH_SIZE + CHECKSUM_SIZE]);
    u64::from_be_bytes(slot)
}

/// Validate a total-length prefix.
pub fn validate_length(length: u32, max_frame_size: u32) -> Result<()> {
    if length < MIN_FRAME_SIZE || length > max_frame_size {
        return Err(SessionError::MalformedLength {
            length,
            min: MIN_FRAME_SIZE,
            max: max_frame_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_size_is_13() {
        assert_eq!(PREFIX_SIZE, 13);
        assert_eq!(MIN_FRAME_SIZE, 13);
    }

    #[test]
    fn test_message_type_roundtrip() {
        for byte in 1u8..=6 {
            assert_eq!(MessageType::from_u8(byte).unwrap().as_u8(), byte);
        }
        assert!(matches!(
            MessageType::from_u8(0),
            Err(SessionError::UnknownMessageType(0))
        ));
        assert!(MessageType::from_u8(7).is_err());
    }

    #[test]
    fn test_sequenced_types() {
        assert!(MessageType::RpcRequest.is_sequenced());
        assert!(MessageType::OneWay.is_sequenced());
        assert!(!MessageType::PingPong.is_sequenced());
        assert!(!MessageType::ConnectRequest.is_sequenced());
    }

    #[test]
    fn test_checksum_skips_its_own_slot() {
        let mut frame = vec![0, 0, 0, 14, 0, 0, 0, 0, 0, 0, 0, 0, 6, 0xAA];
        let before = frame_checksum(&frame);
        frame[4..12].copy_from_slice(&before.to_be_bytes());
        assert_eq!(frame_checksum(&frame), before);
        assert_eq!(stored_checksum(&frame), before);
        assert!(before <= u64::from(u32::MAX));

        frame[13] ^= 1;
        assert_ne!(frame_checksum(&frame), before);
        frame[13] ^= 1;
        frame[3] ^= 1;
        assert_ne!(frame_checksum(&frame), before);
    }

    #[test]
    fn test_validate_length() {
        assert!(validate_length(13, DEFAULT_MAX_FRAME_SIZE).is_ok());
        assert!(validate_length(12, DEFAULT_MAX_FRAME_SIZE).is_err());
        assert!(validate_length(101, 100).is_err());
        assert!(validate_length(100, 100).is_ok());
    }
}
