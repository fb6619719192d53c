//! MessagePack bridge for MESSAGE values, using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map) so peers can
//! evolve payloads by adding fields without breaking positional decoding.
//!
//! # Example
//!
//! ```
//! use sessionwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Chat {
//!     room: u32,
//!     text: String,
//! }
//!
//! let msg = Chat { room: 7, text: "gg".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Chat = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for MESSAGE payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct PlayerState {
        id: u32,
        name: String,
        alive: bool,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct PlayerStateV2 {
        id: u32,
        name: String,
        alive: bool,
        #[serde(default)]
        score: Option<i64>,
    }

    #[test]
    fn test_struct_roundtrip() {
        let original = PlayerState {
            id: 42,
            name: "ana".to_string(),
            alive: true,
        };
        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: PlayerState = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_structs_encode_as_maps() {
        let encoded = MsgPackCodec::encode(&PlayerState {
            id: 1,
            name: "x".to_string(),
            alive: false,
        })
        .unwrap();
        // fixmap with 3 entries, not fixarray
        assert_eq!(encoded[0], 0x83);
    }

    #[test]
    fn test_added_field_is_tolerated() {
        let old = MsgPackCodec::encode(&PlayerState {
            id: 9,
            name: "old".to_string(),
            alive: true,
        })
        .unwrap();
        let upgraded: PlayerStateV2 = MsgPackCodec::decode(&old).unwrap();
        assert_eq!(upgraded.score, None);

        let new = MsgPackCodec::encode(&PlayerStateV2 {
            id: 9,
            name: "new".to_string(),
            alive: true,
            score: Some(12),
        })
        .unwrap();
        let downgraded: PlayerState = MsgPackCodec::decode(&new).unwrap();
        assert_eq!(downgraded.name, "new");
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<PlayerState> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(result.is_err());
    }
}
