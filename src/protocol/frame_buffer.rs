//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForLength`: Need the 4-byte total length
//! - `WaitingForFrame`: Length validated, need the rest of the frame
//!
//! A bad length cannot be skipped, so it fails the whole stream. A bad
//! checksum under a good length only discards that frame; the stream stays
//! aligned and the failure is reported as [`Decoded::Corrupt`] until
//! `max_corrupt_frames` happen back to back.

use bytes::{Bytes, BytesMut};

use super::frame::Frame;
use super::wire_format::{
    frame_checksum, stored_checksum, validate_length, MessageType, DEFAULT_MAX_FRAME_SIZE,
    LENGTH_SIZE, PREFIX_SIZE,
};
use crate::error::{Result, SessionError};

/// Default number of consecutive corrupt frames tolerated.
pub const DEFAULT_MAX_CORRUPT_FRAMES: u32 = 3;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForFrame { total: usize },
}

/// One result from [`FrameBuffer::push`].
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    /// Frame discarded; the stream is still usable.
    Corrupt(SessionError),
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
    max_corrupt_frames: u32,
    consecutive_corrupt: u32,
    corrupt_total: u64,
}

impl FrameBuffer {
    /// Create a frame buffer with default limits (16 MiB frames, 3 corrupt).
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_CORRUPT_FRAMES)
    }

    pub fn with_limits(max_frame_size: u32, max_corrupt_frames: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
            max_corrupt_frames: max_corrupt_frames.max(1),
            consecutive_corrupt: 0,
            corrupt_total: 0,
        }
    }

    /// Push data into the buffer and extract everything now complete.
    ///
    /// # Errors
    ///
    /// Returns error when the stream cannot continue: malformed length, or
    /// too many corrupt frames in a row.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Decoded>> {
        self.buffer.extend_from_slice(data);

        let mut decoded = Vec::new();
        while let Some(item) = self.try_extract_one()? {
            decoded.push(item);
        }
        Ok(decoded)
    }

    fn try_extract_one(&mut self) -> Result<Option<Decoded>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LENGTH_SIZE {
                        return Ok(None);
                    }
                    let b = &self.buffer;
                    let length = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
                    validate_length(length, self.max_frame_size)?;
                    self.state = State::WaitingForFrame {
                        total: length as usize,
                    };
                }
                State::WaitingForFrame { total } => {
                    if self.buffer.len() < total {
                        return Ok(None);
                    }
                    let raw = self.buffer.split_to(total).freeze();
                    self.state = State::WaitingForLength;

                    return match check_and_decode(&raw) {
                        Ok(frame) => {
                            self.consecutive_corrupt = 0;
                            Ok(Some(Decoded::Frame(frame)))
                        }
                        Err(err) => {
                            self.consecutive_corrupt += 1;
                            self.corrupt_total += 1;
                            if self.consecutive_corrupt >= self.max_corrupt_frames {
                                Err(err)
                            } else {
                                Ok(Some(Decoded::Corrupt(err)))
                            }
                        }
                    };
                }
            }
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Corrupt frames seen over the buffer's lifetime.
    pub fn corrupt_total(&self) -> u64 {
        self.corrupt_total
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
        self.consecutive_corrupt = 0;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify the checksum of a complete frame, then decode it.
fn check_and_decode(raw: &Bytes) -> Result<Frame> {
    let expected = stored_checksum(raw);
    let computed = frame_checksum(raw);
    if expected != computed {
        return Err(SessionError::ChecksumMismatch { expected, computed });
    }
    let message_type = MessageType::from_u8(raw[PREFIX_SIZE - 1])?;
    Frame::decode_body(message_type, raw.slice(PREFIX_SIZE..))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectResponse, SocketMessage};

    fn one_way(seq: u64, payload: &'static [u8]) -> Bytes {
        Frame::data(
            seq,
            0,
            SocketMessage::OneWay {
                payload: Bytes::from_static(payload),
            },
        )
        .encode()
    }

    fn frames(decoded: Vec<Decoded>) -> Vec<Frame> {
        decoded
            .into_iter()
            .map(|d| match d {
                Decoded::Frame(f) => f,
                Decoded::Corrupt(e) => panic!("unexpected corrupt frame: {e}"),
            })
            .collect()
    }

    fn seq_of(frame: &Frame) -> u64 {
        match frame {
            Frame::Data { seq, .. } => *seq,
            other => panic!("not a data frame: {other:?}"),
        }
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let out = frames(buffer.push(&one_way(1, b"\x11\x02hi")).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(seq_of(&out[0]), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = Vec::new();
        combined.extend_from_slice(&one_way(1, b"\x00"));
        combined.extend_from_slice(&Frame::data(0, 2, SocketMessage::PingPong).encode());
        combined.extend_from_slice(
            &Frame::ConnectResponse(ConnectResponse {
                success: true,
                verifying_times: 1,
                ack: 9,
            })
            .encode(),
        );

        let out = frames(buffer.push(&combined).unwrap());
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].message_type(), MessageType::PingPong);
        assert_eq!(out[2].message_type(), MessageType::ConnectResponse);
    }

    #[test]
    fn test_fragmented_length_and_body() {
        let mut buffer = FrameBuffer::new();
        let bytes = one_way(42, b"\x03\x54");

        assert!(buffer.push(&bytes[..2]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForLength");

        assert!(buffer.push(&bytes[2..10]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        let out = frames(buffer.push(&bytes[10..]).unwrap());
        assert_eq!(seq_of(&out[0]), 42);
        assert_eq!(buffer.state_name(), "WaitingForLength");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = one_way(7, b"\x08\x01");
        let mut all = Vec::new();
        for byte in bytes.iter() {
            all.extend(frames(buffer.push(&[*byte]).unwrap()));
        }
        assert_eq!(all.len(), 1);
        assert_eq!(seq_of(&all[0]), 7);
    }

    #[test]
    fn test_malformed_length_is_fatal() {
        let mut buffer = FrameBuffer::new();
        let err = buffer.push(&[0, 0, 0, 5]).unwrap_err();
        assert!(matches!(err, SessionError::MalformedLength { length: 5, .. }));

        let mut small = FrameBuffer::with_limits(64, 3);
        assert!(small.push(&[0, 0, 1, 0]).is_err());
    }

    #[test]
    fn test_any_single_byte_flip_is_rejected() {
        let bytes = one_way(1000, b"\x11\x05hello");
        // Every byte after the length field; flips of the length itself
        // either break framing or the checksum, both errors.
        for index in 0..bytes.len() {
            for bit in [0x01u8, 0x80] {
                let mut damaged = bytes.to_vec();
                damaged[index] ^= bit;
                let mut buffer = FrameBuffer::with_limits(DEFAULT_MAX_FRAME_SIZE, 1);
                let outcome = buffer.push(&damaged);
                let accepted = matches!(outcome.as_deref(), Ok([Decoded::Frame(_)]));
                assert!(!accepted, "flip at byte {index} was accepted");
            }
        }
    }

    #[test]
    fn test_corrupt_frame_is_skipped_then_stream_continues() {
        let mut buffer = FrameBuffer::new();
        let mut bad = one_way(1, b"\x00").to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let mut stream = bad;
        stream.extend_from_slice(&one_way(2, b"\x00"));

        let out = buffer.push(&stream).unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[0],
            Decoded::Corrupt(SessionError::ChecksumMismatch { .. })
        ));
        assert!(matches!(&out[1], Decoded::Frame(f) if seq_of(f) == 2));
        assert_eq!(buffer.corrupt_total(), 1);
    }

    #[test]
    fn test_consecutive_corruption_escalates() {
        let mut buffer = FrameBuffer::with_limits(DEFAULT_MAX_FRAME_SIZE, 2);
        let mut bad = one_way(1, b"\x00").to_vec();
        bad[5] ^= 0x10;

        let first = buffer.push(&bad).unwrap();
        assert!(matches!(first[0], Decoded::Corrupt(_)));

        let err = buffer.push(&bad).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_good_frame_resets_corrupt_run() {
        let mut buffer = FrameBuffer::with_limits(DEFAULT_MAX_FRAME_SIZE, 2);
        let mut bad = one_way(1, b"\x00").to_vec();
        bad[20] ^= 0x01;

        buffer.push(&bad).unwrap();
        buffer.push(&one_way(2, b"\x00")).unwrap();
        assert!(buffer.push(&bad).is_ok());
        assert_eq!(buffer.corrupt_total(), 2);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = one_way(1, b"\x00");
        buffer.push(&bytes[..6]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForFrame");
        buffer.clear();
        assert_eq!(buffer.state_name(), "WaitingForLength");
        assert!(buffer.is_empty());
    }
}
