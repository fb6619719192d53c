//! Value codec: tagged values, entity descriptors and MessagePack payloads.
//!
//! - [`WireCodec`] - tagged encoder/decoder for [`Value`]
//! - [`EntityRegistry`] - type id to [`EntityDescriptor`] lookup, with the
//!   built-in list and map codecs
//! - [`MsgPackCodec`] - serde bridge for MESSAGE values
//!
//! # Example
//!
//! ```
//! use sessionwire::codec::{Value, WireCodec};
//!
//! let codec = WireCodec::default();
//! let bytes = codec.encode(&Value::list(vec![Value::from(1i32), Value::from("two")])).unwrap();
//! let decoded = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded.as_list().unwrap()[1].as_str(), Some("two"));
//! ```

mod msgpack;
mod registry;
mod value;
pub mod varint;
mod wire;
mod wire_type;

pub use msgpack::MsgPackCodec;
pub use registry::{
    EntityDescriptor, EntityRegistry, FieldDef, FieldGroup, ListCodec, MapCodec, TypeCodec,
};
pub use value::{
    Entity, EntityKind, EnumValue, Value, FIRST_APPLICATION_TYPE_ID, LIST_TYPE_ID, MAP_TYPE_ID,
};
pub use wire::{WireCodec, WireReader, WireWriter, DEFAULT_MAX_LENGTH, MAX_DEPTH};
pub use wire_type::WireType;
