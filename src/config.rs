//! Session configuration.
//!
//! Every field has a default, so a partial JSON document is a valid config:
//!
//! ```
//! use sessionwire::SessionConfig;
//!
//! let config = SessionConfig::from_json_str(r#"{ "ping_interval_ms": 1000 }"#).unwrap();
//! assert_eq!(config.ping_interval_ms, 1000);
//! assert_eq!(config.session_timeout_ms, 30_000);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::heartbeat::HeartbeatPolicy;
use crate::protocol::{DEFAULT_MAX_CORRUPT_FRAMES, DEFAULT_MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::writer::WriterConfig;

/// Default maximum concurrent RPC handlers per endpoint.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Write silence after which a probe is sent.
    pub ping_interval_ms: u64,
    /// Read silence after which the session is closed.
    pub session_timeout_ms: u64,
    /// Delay before a standalone ack is sent for received traffic.
    pub ack_timeout_ms: u64,
    /// Default deadline for RPC calls.
    pub rpc_timeout_ms: u64,
    /// Deadline for one connect attempt, handshake included.
    pub connect_timeout_ms: u64,
    /// Pause between connect attempts.
    pub reconnect_interval_ms: u64,
    pub max_connect_try_times: u32,
    pub max_pending_messages: usize,
    pub max_cache_messages: usize,
    pub max_frame_size: u32,
    /// Consecutive corrupt frames that drop the connection.
    pub max_corrupt_frames: u32,
    pub max_concurrent_handlers: usize,
    pub heartbeat: HeartbeatPolicy,
    /// Session worker threads; 0 picks the available parallelism.
    pub shards: usize,
    pub writer: WriterConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5_000,
            session_timeout_ms: 30_000,
            ack_timeout_ms: 200,
            rpc_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            reconnect_interval_ms: 1_000,
            max_connect_try_times: 5,
            max_pending_messages: 4_096,
            max_cache_messages: 4_096,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_corrupt_frames: DEFAULT_MAX_CORRUPT_FRAMES,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            heartbeat: HeartbeatPolicy::default(),
            shards: 0,
            writer: WriterConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject settings the session machinery cannot run with.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("ping_interval_ms", self.ping_interval_ms),
            ("session_timeout_ms", self.session_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("max_connect_try_times", u64::from(self.max_connect_try_times)),
            ("max_pending_messages", self.max_pending_messages as u64),
            ("max_cache_messages", self.max_cache_messages as u64),
            ("max_corrupt_frames", u64::from(self.max_corrupt_frames)),
            ("max_concurrent_handlers", self.max_concurrent_handlers as u64),
            ("writer.max_pending_frames", self.writer.max_pending_frames as u64),
            ("writer.channel_capacity", self.writer.channel_capacity as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(SessionError::InvalidConfig(format!("{name} must be > 0")));
        }
        if self.session_timeout_ms <= self.ping_interval_ms {
            return Err(SessionError::InvalidConfig(format!(
                "session_timeout_ms ({}) must exceed ping_interval_ms ({})",
                self.session_timeout_ms, self.ping_interval_ms
            )));
        }
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(SessionError::InvalidConfig(format!(
                "max_frame_size must be at least {MIN_FRAME_SIZE}"
            )));
        }
        if self.writer.channel_capacity < self.writer.max_pending_frames {
            return Err(SessionError::InvalidConfig(
                "writer.channel_capacity must be >= writer.max_pending_frames".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        if self.shards > 0 {
            self.shards
        } else {
            std::thread::available_parallelism().map_or(2, |n| n.get())
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
