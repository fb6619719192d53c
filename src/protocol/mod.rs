//! Protocol module - frame layout, typed frames and stream reassembly.
//!
//! - checksummed, length-prefixed frames (see [`wire_format`])
//! - [`Frame`] / [`SocketMessage`] for handshake, RPC, one-way and ping-pong
//! - [`FrameBuffer`] for accumulating partial reads

mod frame;
mod frame_buffer;
pub mod wire_format;

pub use frame::{ConnectRequest, ConnectResponse, Frame, SocketMessage};
pub use frame_buffer::{Decoded, FrameBuffer, DEFAULT_MAX_CORRUPT_FRAMES};
pub use wire_format::{
    frame_checksum, MessageType, DEFAULT_MAX_FRAME_SIZE, MIN_FRAME_SIZE, PREFIX_SIZE,
};
