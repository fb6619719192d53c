//! Dynamic value model carried by the wire codec.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::msgpack::MsgPackCodec;
use super::wire_type::WireType;
use crate::error::Result;

/// Type id of the built-in list codec.
pub const LIST_TYPE_ID: u32 = 1;
/// Type id of the built-in map codec.
pub const MAP_TYPE_ID: u32 = 2;
/// First type id available to applications.
pub const FIRST_APPLICATION_TYPE_ID: u32 = 16;

/// How an entity lays out its fields on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Fields written as `(field number, value)` pairs; absent fields skipped.
    Keyed,
    /// Every field written positionally in declaration order.
    Indexed,
    /// Body produced by a registered [`TypeCodec`](super::TypeCodec).
    Custom,
}

impl EntityKind {
    pub fn wire_type(self) -> WireType {
        match self {
            EntityKind::Keyed => WireType::KeyedEntity,
            EntityKind::Indexed => WireType::IndexedEntity,
            EntityKind::Custom => WireType::CustomEntity,
        }
    }
}

/// A structured value described by a registered descriptor.
///
/// `fields` follows the descriptor's flattened field order: the entity's own
/// fields first, then each base type's fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub type_id: u32,
    pub fields: Vec<Value>,
}

impl Entity {
    pub fn new(kind: EntityKind, type_id: u32, fields: Vec<Value>) -> Self {
        Self {
            kind,
            type_id,
            fields,
        }
    }

    /// Field at a flattened index, `Null` when out of range.
    pub fn field(&self, index: usize) -> &Value {
        self.fields.get(index).unwrap_or(&Value::Null)
    }
}

/// An enum constant identified by enum type id and ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumValue {
    pub type_id: u32,
    pub ordinal: u32,
}

/// Any value the codec can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Bool(bool),
    ByteArray(Bytes),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    CharArray(Vec<char>),
    BoolArray(Vec<bool>),
    String(String),
    /// Externally-defined structured payload (MessagePack by convention).
    Message(Bytes),
    Enum(EnumValue),
    /// Opaque binary chunk.
    Chunk(Bytes),
    Entity(Entity),
}

impl Value {
    /// The concrete tag of this value (the RUN_TIME resolution).
    pub fn wire_type(&self) -> WireType {
        match self {
            Value::Null => WireType::Null,
            Value::Byte(_) => WireType::Byte,
            Value::Short(_) => WireType::Short,
            Value::Int(_) => WireType::Int,
            Value::Long(_) => WireType::Long,
            Value::Float(_) => WireType::Float,
            Value::Double(_) => WireType::Double,
            Value::Char(_) => WireType::Char,
            Value::Bool(_) => WireType::Boolean,
            Value::ByteArray(_) => WireType::ByteArray,
            Value::ShortArray(_) => WireType::ShortArray,
            Value::IntArray(_) => WireType::IntArray,
            Value::LongArray(_) => WireType::LongArray,
            Value::FloatArray(_) => WireType::FloatArray,
            Value::DoubleArray(_) => WireType::DoubleArray,
            Value::CharArray(_) => WireType::CharArray,
            Value::BoolArray(_) => WireType::BooleanArray,
            Value::String(_) => WireType::String,
            Value::Message(_) => WireType::Message,
            Value::Enum(_) => WireType::Enum,
            Value::Chunk(_) => WireType::Chunk,
            Value::Entity(e) => e.kind.wire_type(),
        }
    }

    /// A list, carried by the built-in list codec.
    pub fn list(items: Vec<Value>) -> Self {
        Value::Entity(Entity::new(EntityKind::Custom, LIST_TYPE_ID, items))
    }

    /// A map, carried by the built-in map codec as alternating keys and values.
    pub fn map<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let fields = entries.into_iter().flat_map(|(k, v)| [k, v]).collect();
        Value::Entity(Entity::new(EntityKind::Custom, MAP_TYPE_ID, fields))
    }

    /// Wrap any serde value as a MESSAGE payload.
    pub fn message<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Value::Message(Bytes::from(MsgPackCodec::encode(value)?)))
    }

    /// Decode a MESSAGE payload into a serde type.
    ///
    /// Returns `None` when this value is not a MESSAGE.
    pub fn decode_message<T: DeserializeOwned>(&self) -> Option<Result<T>> {
        match self {
            Value::Message(bytes) => Some(MsgPackCodec::decode(bytes)),
            _ => None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(i64::from(v)),
            Value::Short(v) => Some(i64::from(v)),
            Value::Int(v) => Some(i64::from(v)),
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::ByteArray(b) | Value::Chunk(b) | Value::Message(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::Entity(e) if e.kind == EntityKind::Custom && e.type_id == LIST_TYPE_ID => {
                Some(&e.fields)
            }
            _ => None,
        }
    }

    /// Key/value pairs of a map value.
    pub fn as_map(&self) -> Option<Vec<(&Value, &Value)>> {
        match self {
            Value::Entity(e) if e.kind == EntityKind::Custom && e.type_id == MAP_TYPE_ID => Some(
                e.fields
                    .chunks_exact(2)
                    .map(|pair| (&pair[0], &pair[1]))
                    .collect(),
            ),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    char => Char,
    bool => Bool,
    String => String,
    Vec<i16> => ShortArray,
    Vec<i32> => IntArray,
    Vec<i64> => LongArray,
    Vec<f32> => FloatArray,
    Vec<f64> => DoubleArray,
    Vec<char> => CharArray,
    Vec<bool> => BoolArray,
    Bytes => Chunk,
    EnumValue => Enum,
    Entity => Entity,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::ByteArray(Bytes::from(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_wire_type_follows_variant() {
        assert_eq!(Value::Null.wire_type(), WireType::Null);
        assert_eq!(Value::from(7i32).wire_type(), WireType::Int);
        assert_eq!(Value::from("hi").wire_type(), WireType::String);
        assert_eq!(Value::list(vec![]).wire_type(), WireType::CustomEntity);
        let keyed = Entity::new(EntityKind::Keyed, 20, vec![]);
        assert_eq!(Value::from(keyed).wire_type(), WireType::KeyedEntity);
    }

    #[test]
    fn test_map_helpers() {
        let map = Value::map(vec![
            (Value::from("a"), Value::from(1i32)),
            (Value::from("b"), Value::from(2i32)),
        ]);
        let pairs = map.as_map().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].0.as_str(), Some("b"));
        assert_eq!(pairs[1].1.as_i32(), Some(2));
        assert!(map.as_list().is_none());
    }

    #[test]
    fn test_message_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Move {
            x: i32,
            y: i32,
        }

        let value = Value::message(&Move { x: 3, y: -4 }).unwrap();
        let decoded: Move = value.decode_message().unwrap().unwrap();
        assert_eq!(decoded, Move { x: 3, y: -4 });
        assert!(Value::Null.decode_message::<Move>().is_none());
    }

    #[test]
    fn test_option_into_value() {
        assert!(Value::from(None::<i32>).is_null());
        assert_eq!(Value::from(Some(5i64)).as_i64(), Some(5));
    }

    #[test]
    fn test_entity_field_out_of_range_is_null() {
        let e = Entity::new(EntityKind::Indexed, 30, vec![Value::from(1i32)]);
        assert_eq!(e.field(0).as_i32(), Some(1));
        assert!(e.field(5).is_null());
    }
}
