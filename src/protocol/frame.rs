//! Typed frames and their encoding.
//!
//! Payload-bearing frames keep their payload as `bytes::Bytes` holding an
//! already-encoded tagged value, so queued messages can be re-framed with a
//! fresh ack on resend without re-encoding the value.
//!
//! # Example
//!
//! ```
//! use sessionwire::protocol::{Frame, FrameBuffer, SocketMessage};
//! use bytes::Bytes;
//!
//! let frame = Frame::data(7, 3, SocketMessage::OneWay {
//!     payload: Bytes::from_static(&[0]),
//! });
//! let bytes = frame.encode();
//!
//! let mut buffer = FrameBuffer::new();
//! let decoded = buffer.push(&bytes).unwrap();
//! assert_eq!(decoded.len(), 1);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire_format::{
    frame_checksum, MessageType, CHECKSUM_SIZE, CONNECT_RESPONSE_HEADER_SIZE, LENGTH_SIZE,
    ONE_WAY_HEADER_SIZE, PING_PONG_HEADER_SIZE, PREFIX_SIZE, RPC_REQUEST_HEADER_SIZE,
    RPC_RESPONSE_HEADER_SIZE,
};
use crate::codec::varint::{get_uvarint, put_uvarint};
use crate::codec::WireType;
use crate::error::{Result, SessionError};

/// Handshake opened by the client on every physical connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub client_identity: u64,
    pub verifying_times: i32,
    pub ack: u64,
    pub session_id: String,
}

impl ConnectRequest {
    /// Fail with [`SessionError::StaleHandshake`] unless this attempt is newer
    /// than the highest one already accepted.
    pub fn check_fresh(&self, accepted: i32) -> Result<()> {
        if self.verifying_times <= accepted {
            return Err(SessionError::StaleHandshake {
                received: self.verifying_times,
                current: accepted,
            });
        }
        Ok(())
    }
}

/// Server answer to a [`ConnectRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub success: bool,
    pub verifying_times: i32,
    pub ack: u64,
}

/// Session-level message: everything that carries `seq`/`ack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    RpcRequest {
        request_id: u64,
        is_sync: bool,
        payload: Bytes,
    },
    RpcResponse {
        request_id: u64,
        result_code: i32,
        payload: Option<Bytes>,
    },
    OneWay {
        payload: Bytes,
    },
    /// Heartbeat or standalone ack. Never queued.
    PingPong,
}

impl SocketMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            SocketMessage::RpcRequest { .. } => MessageType::RpcRequest,
            SocketMessage::RpcResponse { .. } => MessageType::RpcResponse,
            SocketMessage::OneWay { .. } => MessageType::OneWay,
            SocketMessage::PingPong => MessageType::PingPong,
        }
    }

    /// Size of the frame this message travels in.
    pub fn frame_len(&self) -> usize {
        PREFIX_SIZE + self.body_len()
    }

    /// Fail with [`SessionError::FrameTooLarge`] unless the frame fits `max_frame_size`.
    pub fn check_frame_size(&self, max_frame_size: u32) -> Result<()> {
        let size = self.frame_len();
        if size > max_frame_size as usize {
            return Err(SessionError::FrameTooLarge {
                size,
                limit: max_frame_size,
            });
        }
        Ok(())
    }

    fn body_len(&self) -> usize {
        match self {
            SocketMessage::RpcRequest { payload, .. } => RPC_REQUEST_HEADER_SIZE + payload.len(),
            SocketMessage::RpcResponse { payload, .. } => {
                RPC_RESPONSE_HEADER_SIZE + payload.as_ref().map_or(0, Bytes::len)
            }
            SocketMessage::OneWay { payload } => ONE_WAY_HEADER_SIZE + payload.len(),
            SocketMessage::PingPong => PING_PONG_HEADER_SIZE,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    /// RPC, one-way and ping-pong frames.
    Data {
        seq: u64,
        ack: u64,
        message: SocketMessage,
    },
}

impl Frame {
    pub fn data(seq: u64, ack: u64, message: SocketMessage) -> Self {
        Frame::Data { seq, ack, message }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::ConnectRequest(_) => MessageType::ConnectRequest,
            Frame::ConnectResponse(_) => MessageType::ConnectResponse,
            Frame::Data { message, .. } => message.message_type(),
        }
    }

    /// Total encoded size, length field included.
    pub fn encoded_len(&self) -> usize {
        PREFIX_SIZE
            + match self {
                Frame::ConnectRequest(req) => connect_request_body_len(req),
                Frame::ConnectResponse(_) => CONNECT_RESPONSE_HEADER_SIZE,
                Frame::Data { message, .. } => message.body_len(),
            }
    }

    /// Encode into a standalone buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded frame to `buf`.
    ///
    /// Callers keep frames under the configured maximum, so the length
    /// always fits the 32-bit field.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        let total = self.encoded_len();
        buf.reserve(total);
        buf.put_u32(total as u32);
        buf.put_u64(0);
        buf.put_u8(self.message_type().as_u8());

        match self {
            Frame::ConnectRequest(req) => {
                buf.put_u64(req.client_identity);
                buf.put_i32(req.verifying_times);
                buf.put_u64(req.ack);
                buf.put_u8(WireType::String.tag());
                put_uvarint(buf, req.session_id.len() as u64);
                buf.put_slice(req.session_id.as_bytes());
            }
            Frame::ConnectResponse(resp) => {
                buf.put_u8(u8::from(resp.success));
                buf.put_i32(resp.verifying_times);
                buf.put_u64(resp.ack);
            }
            Frame::Data { seq, ack, message } => {
                buf.put_u64(*seq);
                buf.put_u64(*ack);
                match message {
                    SocketMessage::RpcRequest {
                        request_id,
                        is_sync,
                        payload,
                    } => {
                        buf.put_u64(*request_id);
                        buf.put_u8(u8::from(*is_sync));
                        buf.put_slice(payload);
                    }
                    SocketMessage::RpcResponse {
                        request_id,
                        result_code,
                        payload,
                    } => {
                        buf.put_u64(*request_id);
                        buf.put_i32(*result_code);
                        if let Some(payload) = payload {
                            buf.put_slice(payload);
                        }
                    }
                    SocketMessage::OneWay { payload } => buf.put_slice(payload),
                    SocketMessage::PingPong => {}
                }
            }
        }

        debug_assert_eq!(buf.len() - start, total);
        let checksum = frame_checksum(&buf[start..]);
        buf[start + LENGTH_SIZE..start + LENGTH_SIZE + CHECKSUM_SIZE]
            .copy_from_slice(&checksum.to_be_bytes());
    }

    /// Decode the part of a frame after the message type byte.
    ///
    /// The checksum has already been verified by the caller.
    pub fn decode_body(message_type: MessageType, mut body: Bytes) -> Result<Frame> {
        let frame = match message_type {
            MessageType::ConnectRequest => {
                need(&body, 8 + 4 + 8 + 1, "connect request")?;
                let client_identity = body.get_u64();
                let verifying_times = body.get_i32();
                let ack = body.get_u64();
                let tag = body.get_u8();
                if tag != WireType::String.tag() {
                    return Err(SessionError::MalformedFrame(format!(
                        "session id tag {tag}, expected STRING"
                    )));
                }
                let len = get_uvarint(&mut body)?;
                if len != body.len() as u64 {
                    return Err(SessionError::MalformedFrame(format!(
                        "session id length {len} with {} bytes left",
                        body.len()
                    )));
                }
                let session_id = String::from_utf8(body.to_vec())
                    .map_err(|_| SessionError::MalformedFrame("session id not UTF-8".into()))?;
                body.clear();
                Frame::ConnectRequest(ConnectRequest {
                    client_identity,
                    verifying_times,
                    ack,
                    session_id,
                })
            }
            MessageType::ConnectResponse => {
                need(&body, CONNECT_RESPONSE_HEADER_SIZE, "connect response")?;
                let success = match body.get_u8() {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(SessionError::MalformedFrame(format!(
                            "connect response success byte {other}"
                        )))
                    }
                };
                Frame::ConnectResponse(ConnectResponse {
                    success,
                    verifying_times: body.get_i32(),
                    ack: body.get_u64(),
                })
            }
            MessageType::RpcRequest => {
                need(&body, RPC_REQUEST_HEADER_SIZE + 1, "rpc request")?;
                let seq = body.get_u64();
                let ack = body.get_u64();
                let request_id = body.get_u64();
                let is_sync = body.get_u8() != 0;
                let payload = body.split_off(0);
                Frame::data(
                    seq,
                    ack,
                    SocketMessage::RpcRequest {
                        request_id,
                        is_sync,
                        payload,
                    },
                )
            }
            MessageType::RpcResponse => {
                need(&body, RPC_RESPONSE_HEADER_SIZE, "rpc response")?;
                let seq = body.get_u64();
                let ack = body.get_u64();
                let request_id = body.get_u64();
                let result_code = body.get_i32();
                let payload = (!body.is_empty()).then(|| body.split_off(0));
                Frame::data(
                    seq,
                    ack,
                    SocketMessage::RpcResponse {
                        request_id,
                        result_code,
                        payload,
                    },
                )
            }
            MessageType::OneWay => {
                need(&body, ONE_WAY_HEADER_SIZE + 1, "one-way message")?;
                let seq = body.get_u64();
                let ack = body.get_u64();
                let payload = body.split_off(0);
                Frame::data(seq, ack, SocketMessage::OneWay { payload })
            }
            MessageType::PingPong => {
                need(&body, PING_PONG_HEADER_SIZE, "ping-pong")?;
                Frame::data(body.get_u64(), body.get_u64(), SocketMessage::PingPong)
            }
        };

        if !body.is_empty() {
            return Err(SessionError::MalformedFrame(format!(
                "{} trailing bytes after {:?}",
                body.len(),
                message_type
            )));
        }
        Ok(frame)
    }
}

fn connect_request_body_len(req: &ConnectRequest) -> usize {
    let len = req.session_id.len() as u64;
    let mut varint_len = 1;
    let mut rest = len >> 7;
    while rest > 0 {
        varint_len += 1;
        rest >>= 7;
    }
    8 + 4 + 8 + 1 + varint_len + req.session_id.len()
}

fn need(body: &Bytes, min: usize, what: &str) -> Result<()> {
    if body.len() < min {
        return Err(SessionError::MalformedFrame(format!(
            "{what} body is {} bytes, needs at least {min}",
            body.len()
        )));
    }
    Ok(())
}
