//! Tagged value encoder and decoder.
//!
//! # Layout
//!
//! ```text
//! value      := tag:u8 body
//! BYTE       := i8
//! SHORT/INT/LONG := zig-zag varint
//! FLOAT/DOUBLE   := IEEE-754, big-endian
//! CHAR       := varint code point
//! BOOLEAN    := u8 (0 or 1)
//! X_ARRAY    := count:uvarint element*
//! STRING     := len:uvarint utf8
//! MESSAGE    := len:uvarint bytes
//! CHUNK      := len:uvarint bytes
//! ENUM       := type_id:uvarint ordinal:uvarint
//! KEYED      := type_id:uvarint count:uvarint (field_no:uvarint value)*
//! INDEXED    := type_id:uvarint value*            (one per declared field)
//! CUSTOM     := type_id:uvarint <TypeCodec body>
//! ```
//!
//! Every count and length is checked against the configured limit and the
//! remaining input before anything is allocated.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::registry::EntityRegistry;
use super::value::{Entity, EntityKind, EnumValue, Value};
use super::varint::{get_svarint, get_uvarint, put_svarint, put_uvarint};
use super::wire_type::WireType;
use crate::error::WireError;

/// Default limit on any count or length prefix.
pub const DEFAULT_MAX_LENGTH: usize = 16 * 1024 * 1024;

/// Deepest entity nesting accepted in either direction.
pub const MAX_DEPTH: usize = 64;

/// Value codec bound to an entity registry.
#[derive(Debug, Clone)]
pub struct WireCodec {
    registry: Arc<EntityRegistry>,
    max_length: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(Arc::new(EntityRegistry::new()))
    }
}

impl WireCodec {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            max_length: DEFAULT_MAX_LENGTH,
        }
    }

    /// Override the limit on count and length prefixes.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn writer<'a>(&'a self, buf: &'a mut BytesMut) -> WireWriter<'a> {
        WireWriter {
            codec: self,
            buf,
            depth: 0,
        }
    }

    pub fn reader<'a>(&'a self, input: &'a [u8]) -> WireReader<'a> {
        WireReader {
            codec: self,
            input,
            depth: 0,
        }
    }

    /// Encode one tagged value.
    pub fn encode(&self, value: &Value) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        self.writer(&mut buf).write_value(value)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one tagged value; trailing bytes are an error.
    pub fn decode(&self, input: &[u8]) -> Result<Value, WireError> {
        self.decode_expected(input, WireType::RunTime)
    }

    /// Decode exactly one value whose tag must satisfy `expected`.
    pub fn decode_expected(&self, input: &[u8], expected: WireType) -> Result<Value, WireError> {
        let mut reader = self.reader(input);
        let value = reader.read_expected(expected)?;
        reader.finish()?;
        Ok(value)
    }
}

/// Appends tagged values to a buffer.
pub struct WireWriter<'a> {
    codec: &'a WireCodec,
    buf: &'a mut BytesMut,
    depth: usize,
}

impl WireWriter<'_> {
    /// Write a value with its concrete tag.
    pub fn write_value(&mut self, value: &Value) -> Result<(), WireError> {
        self.buf.put_u8(value.wire_type().tag());
        self.write_body(value)
    }

    /// Write a value, failing if its tag does not satisfy `expected`.
    pub fn write_expected(&mut self, value: &Value, expected: WireType) -> Result<(), WireError> {
        let found = value.wire_type();
        if !expected.accepts(found) {
            return Err(WireError::TypeMismatch { expected, found });
        }
        self.write_value(value)
    }

    /// Write a count or length prefix after checking the limit.
    pub fn write_len(&mut self, len: usize) -> Result<(), WireError> {
        if len > self.codec.max_length {
            return Err(WireError::InvalidLength {
                length: len as u64,
                limit: self.codec.max_length,
            });
        }
        put_uvarint(self.buf, len as u64);
        Ok(())
    }

    pub fn write_uvarint(&mut self, value: u64) {
        put_uvarint(self.buf, value);
    }

    pub fn write_svarint(&mut self, value: i64) {
        put_svarint(self.buf, value);
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.write_len(bytes.len())?;
        self.buf.put_slice(bytes);
        Ok(())
    }

    fn write_body(&mut self, value: &Value) -> Result<(), WireError> {
        match value {
            Value::Null => {}
            Value::Byte(v) => self.buf.put_i8(*v),
            Value::Short(v) => put_svarint(self.buf, i64::from(*v)),
            Value::Int(v) => put_svarint(self.buf, i64::from(*v)),
            Value::Long(v) => put_svarint(self.buf, *v),
            Value::Float(v) => self.buf.put_f32(*v),
            Value::Double(v) => self.buf.put_f64(*v),
            Value::Char(c) => put_uvarint(self.buf, u64::from(u32::from(*c))),
            Value::Bool(b) => self.buf.put_u8(u8::from(*b)),
            Value::ByteArray(b) | Value::Message(b) | Value::Chunk(b) => self.write_bytes(b)?,
            Value::ShortArray(items) => {
                self.write_len(items.len())?;
                for v in items {
                    put_svarint(self.buf, i64::from(*v));
                }
            }
            Value::IntArray(items) => {
                self.write_len(items.len())?;
                for v in items {
                    put_svarint(self.buf, i64::from(*v));
                }
            }
            Value::LongArray(items) => {
                self.write_len(items.len())?;
                for v in items {
                    put_svarint(self.buf, *v);
                }
            }
            Value::FloatArray(items) => {
                self.write_len(items.len())?;
                for v in items {
                    self.buf.put_f32(*v);
                }
            }
            Value::DoubleArray(items) => {
                self.write_len(items.len())?;
                for v in items {
                    self.buf.put_f64(*v);
                }
            }
            Value::CharArray(items) => {
                self.write_len(items.len())?;
                for c in items {
                    put_uvarint(self.buf, u64::from(u32::from(*c)));
                }
            }
            Value::BoolArray(items) => {
                self.write_len(items.len())?;
                for b in items {
                    self.buf.put_u8(u8::from(*b));
                }
            }
            Value::String(s) => self.write_bytes(s.as_bytes())?,
            Value::Enum(e) => {
                put_uvarint(self.buf, u64::from(e.type_id));
                put_uvarint(self.buf, u64::from(e.ordinal));
            }
            Value::Entity(entity) => self.write_entity(entity)?,
        }
        Ok(())
    }

    fn write_entity(&mut self, entity: &Entity) -> Result<(), WireError> {
        if self.depth >= MAX_DEPTH {
            return Err(WireError::TooDeep(MAX_DEPTH));
        }
        let codec = self.codec;
        let desc = codec.registry.require(entity.type_id)?;
        if desc.kind() != entity.kind {
            return Err(WireError::EntityLayout {
                type_id: entity.type_id,
                reason: format!("registered as {:?}, value is {:?}", desc.kind(), entity.kind),
            });
        }
        if entity.kind != EntityKind::Custom && entity.fields.len() > desc.field_count() {
            return Err(WireError::EntityLayout {
                type_id: entity.type_id,
                reason: format!(
                    "{} values for {} declared fields",
                    entity.fields.len(),
                    desc.field_count()
                ),
            });
        }

        self.depth += 1;
        put_uvarint(self.buf, u64::from(entity.type_id));
        let result = match entity.kind {
            EntityKind::Keyed => {
                let present = entity.fields.iter().filter(|v| !v.is_null()).count();
                put_uvarint(self.buf, present as u64);
                desc.fields()
                    .zip(entity.fields.iter())
                    .filter(|(_, value)| !value.is_null())
                    .try_for_each(|(def, value)| {
                        put_uvarint(self.buf, u64::from(def.number));
                        self.write_expected(value, def.wire_type)
                    })
            }
            EntityKind::Indexed => desc.fields().enumerate().try_for_each(|(i, def)| {
                self.write_expected(entity.field(i), def.wire_type)
            }),
            EntityKind::Custom => match desc.codec() {
                Some(custom) => custom.encode(entity, self),
                None => Err(WireError::EntityLayout {
                    type_id: entity.type_id,
                    reason: "custom entity without a codec".to_string(),
                }),
            },
        };
        self.depth -= 1;
        result
    }
}

/// Reads tagged values from a byte slice.
pub struct WireReader<'a> {
    codec: &'a WireCodec,
    input: &'a [u8],
    depth: usize,
}

impl<'a> WireReader<'a> {
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Fail unless all input has been consumed.
    pub fn finish(&self) -> Result<(), WireError> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.input.len()))
        }
    }

    /// Read a value with any tag.
    pub fn read_value(&mut self) -> Result<Value, WireError> {
        self.read_expected(WireType::RunTime)
    }

    /// Read a value whose tag must satisfy `expected`.
    pub fn read_expected(&mut self, expected: WireType) -> Result<Value, WireError> {
        self.ensure(1)?;
        let found = WireType::from_tag(self.input.get_u8())?;
        if !expected.accepts(found) {
            return Err(WireError::TypeMismatch { expected, found });
        }
        self.read_body(found)
    }

    /// Read a count prefix whose elements occupy at least `min_element_size`
    /// bytes each.
    pub fn read_len(&mut self, min_element_size: usize) -> Result<usize, WireError> {
        let len = get_uvarint(&mut self.input)?;
        let limit = self.codec.max_length;
        let fits = usize::try_from(len)
            .ok()
            .filter(|&n| n <= limit)
            .filter(|&n| n.saturating_mul(min_element_size) <= self.input.len());
        fits.ok_or(WireError::InvalidLength { length: len, limit })
    }

    pub fn read_uvarint(&mut self) -> Result<u64, WireError> {
        get_uvarint(&mut self.input)
    }

    pub fn read_svarint(&mut self) -> Result<i64, WireError> {
        get_svarint(&mut self.input)
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        u32::try_from(self.read_uvarint()?).map_err(|_| WireError::VarintOverflow)
    }

    fn ensure(&self, needed: usize) -> Result<(), WireError> {
        if self.input.len() < needed {
            Err(WireError::Truncated {
                needed: needed - self.input.len(),
            })
        } else {
            Ok(())
        }
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_len(1)?;
        let input = self.input;
        let (head, tail) = input.split_at(len);
        self.input = tail;
        Ok(head)
    }

    fn read_char(&mut self) -> Result<char, WireError> {
        let code = self.read_u32()?;
        char::from_u32(code).ok_or(WireError::InvalidChar(code))
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.input.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    fn read_short(&mut self) -> Result<i16, WireError> {
        i16::try_from(self.read_svarint()?).map_err(|_| WireError::VarintOverflow)
    }

    fn read_int(&mut self) -> Result<i32, WireError> {
        i32::try_from(self.read_svarint()?).map_err(|_| WireError::VarintOverflow)
    }

    fn read_body(&mut self, ty: WireType) -> Result<Value, WireError> {
        let value = match ty {
            WireType::Null => Value::Null,
            WireType::Byte => {
                self.ensure(1)?;
                Value::Byte(self.input.get_i8())
            }
            WireType::Short => Value::Short(self.read_short()?),
            WireType::Int => Value::Int(self.read_int()?),
            WireType::Long => Value::Long(self.read_svarint()?),
            WireType::Float => {
                self.ensure(4)?;
                Value::Float(self.input.get_f32())
            }
            WireType::Double => {
                self.ensure(8)?;
                Value::Double(self.input.get_f64())
            }
            WireType::Char => Value::Char(self.read_char()?),
            WireType::Boolean => {
                self.ensure(1)?;
                Value::Bool(self.read_bool()?)
            }
            WireType::ByteArray => Value::ByteArray(Bytes::copy_from_slice(self.read_bytes()?)),
            WireType::ShortArray => {
                let n = self.read_len(1)?;
                Value::ShortArray((0..n).map(|_| self.read_short()).collect::<Result<_, _>>()?)
            }
            WireType::IntArray => {
                let n = self.read_len(1)?;
                Value::IntArray((0..n).map(|_| self.read_int()).collect::<Result<_, _>>()?)
            }
            WireType::LongArray => {
                let n = self.read_len(1)?;
                Value::LongArray((0..n).map(|_| self.read_svarint()).collect::<Result<_, _>>()?)
            }
            WireType::FloatArray => {
                let n = self.read_len(4)?;
                Value::FloatArray((0..n).map(|_| self.input.get_f32()).collect())
            }
            WireType::DoubleArray => {
                let n = self.read_len(8)?;
                Value::DoubleArray((0..n).map(|_| self.input.get_f64()).collect())
            }
            WireType::CharArray => {
                let n = self.read_len(1)?;
                Value::CharArray((0..n).map(|_| self.read_char()).collect::<Result<_, _>>()?)
            }
            WireType::BooleanArray => {
                let n = self.read_len(1)?;
                Value::BoolArray((0..n).map(|_| self.read_bool()).collect::<Result<_, _>>()?)
            }
            WireType::String => {
                let bytes = self.read_bytes()?;
                let s = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)?;
                Value::String(s.to_owned())
            }
            WireType::Message => Value::Message(Bytes::copy_from_slice(self.read_bytes()?)),
            WireType::Enum => {
                let type_id = self.read_u32()?;
                let ordinal = self.read_u32()?;
                Value::Enum(EnumValue { type_id, ordinal })
            }
            WireType::Chunk => Value::Chunk(Bytes::copy_from_slice(self.read_bytes()?)),
            WireType::KeyedEntity => self.read_entity(EntityKind::Keyed)?,
            WireType::IndexedEntity => self.read_entity(EntityKind::Indexed)?,
            WireType::CustomEntity => self.read_entity(EntityKind::Custom)?,
            WireType::RunTime => return Err(WireError::UnknownTag(ty.tag())),
        };
        Ok(value)
    }

    fn read_entity(&mut self, kind: EntityKind) -> Result<Value, WireError> {
        if self.depth >= MAX_DEPTH {
            return Err(WireError::TooDeep(MAX_DEPTH));
        }
        let type_id = self.read_u32()?;
        let codec = self.codec;
        let desc = codec.registry.require(type_id)?;
        if desc.kind() != kind {
            return Err(WireError::EntityLayout {
                type_id,
                reason: format!("registered as {:?}, tag says {:?}", desc.kind(), kind),
            });
        }

        self.depth += 1;
        let fields = match kind {
            EntityKind::Keyed => self.read_keyed_fields(desc),
            EntityKind::Indexed => desc
                .fields()
                .map(|def| self.read_expected(def.wire_type))
                .collect(),
            EntityKind::Custom => match desc.codec() {
                Some(custom) => custom.decode(type_id, self),
                None => Err(WireError::EntityLayout {
                    type_id,
                    reason: "custom entity without a codec".to_string(),
                }),
            },
        };
        self.depth -= 1;
        Ok(Value::Entity(Entity::new(kind, type_id, fields?)))
    }

    fn read_keyed_fields(
        &mut self,
        desc: &super::registry::EntityDescriptor,
    ) -> Result<Vec<Value>, WireError> {
        // Each pair needs at least a field number byte and a tag byte.
        let count = self.read_len(2)?;
        let mut fields = vec![Value::Null; desc.field_count()];
        for _ in 0..count {
            let number = self.read_u32()?;
            match desc.index_of(number) {
                Some(index) => {
                    let expected = desc.fields().nth(index).map_or(WireType::RunTime, |f| f.wire_type);
                    fields[index] = self.read_expected(expected)?;
                }
                None => {
                    let skipped = self.read_value()?;
                    tracing::trace!(
                        type_id = desc.type_id(),
                        field = number,
                        tag = ?skipped.wire_type(),
                        "skipping unknown field"
                    );
                }
            }
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::registry::EntityDescriptor;
    use proptest::prelude::*;

    fn codec_with_units() -> WireCodec {
        let mut registry = EntityRegistry::new();
        registry
            .register(
                EntityDescriptor::keyed(20, "Unit")
                    .field(1, "id", WireType::Long)
                    .field(2, "name", WireType::String),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::keyed(21, "Hero")
                    .extends(20)
                    .field(10, "level", WireType::Int)
                    .field(11, "tags", WireType::RunTime),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::indexed(30, "Point")
                    .field(1, "x", WireType::Int)
                    .field(2, "y", WireType::Int),
            )
            .unwrap();
        WireCodec::new(Arc::new(registry))
    }

    #[test]
    fn test_primitive_layouts() {
        let codec = WireCodec::default();
        assert_eq!(codec.encode(&Value::Null).unwrap().as_ref(), &[0]);
        assert_eq!(codec.encode(&Value::Int(-1)).unwrap().as_ref(), &[3, 1]);
        assert_eq!(codec.encode(&Value::Bool(true)).unwrap().as_ref(), &[8, 1]);
        assert_eq!(
            codec.encode(&Value::from("hi")).unwrap().as_ref(),
            &[17, 2, b'h', b'i']
        );
        assert_eq!(
            codec.encode(&Value::Float(1.0)).unwrap().as_ref(),
            &[5, 0x3F, 0x80, 0, 0]
        );
    }

    #[test]
    fn test_arrays_and_blobs_roundtrip() {
        let codec = WireCodec::default();
        let values = vec![
            Value::ByteArray(Bytes::from_static(&[1, 2, 3])),
            Value::ShortArray(vec![i16::MIN, 0, i16::MAX]),
            Value::LongArray(vec![i64::MIN, -1, i64::MAX]),
            Value::DoubleArray(vec![0.5, -2.25]),
            Value::FloatArray(vec![]),
            Value::CharArray(vec!['a', 'ß', '🦀']),
            Value::BoolArray(vec![true, false, true]),
            Value::Double(std::f64::consts::PI),
            Value::Message(Bytes::from_static(b"\x81\xa1a\x01")),
            Value::Enum(EnumValue {
                type_id: 40,
                ordinal: 3,
            }),
        ];
        for value in values {
            let bytes = codec.encode(&value).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_keyed_entity_with_inheritance() {
        let codec = codec_with_units();
        let hero = Value::Entity(Entity::new(
            EntityKind::Keyed,
            21,
            vec![
                Value::Int(7),
                Value::list(vec![Value::from("tank")]),
                Value::Long(1001),
                Value::Null,
            ],
        ));
        let bytes = codec.encode(&hero).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, hero);
        assert!(decoded.as_entity().unwrap().field(3).is_null());
    }

    #[test]
    fn test_keyed_entity_skips_unknown_fields() {
        let codec = codec_with_units();
        // Unit with an extra field 9 the reader does not know.
        let mut buf = BytesMut::new();
        {
            let mut w = codec.writer(&mut buf);
            w.write_raw(&[WireType::KeyedEntity.tag()]);
            w.write_uvarint(20);
            w.write_uvarint(2);
            w.write_uvarint(9);
            w.write_value(&Value::from("ignored")).unwrap();
            w.write_uvarint(1);
            w.write_value(&Value::Long(5)).unwrap();
        }
        let decoded = codec.decode(&buf).unwrap();
        let unit = decoded.as_entity().unwrap();
        assert_eq!(unit.field(0).as_i64(), Some(5));
        assert!(unit.field(1).is_null());
    }

    #[test]
    fn test_indexed_entity_pads_missing_fields() {
        let codec = codec_with_units();
        let short = Value::Entity(Entity::new(EntityKind::Indexed, 30, vec![Value::Int(1)]));
        let decoded = codec.decode(&codec.encode(&short).unwrap()).unwrap();
        assert_eq!(decoded.as_entity().unwrap().fields, vec![Value::Int(1), Value::Null]);
    }

    #[test]
    fn test_field_type_enforced() {
        let codec = codec_with_units();
        let bad = Value::Entity(Entity::new(
            EntityKind::Indexed,
            30,
            vec![Value::from("x"), Value::Int(2)],
        ));
        assert_eq!(
            codec.encode(&bad),
            Err(WireError::TypeMismatch {
                expected: WireType::Int,
                found: WireType::String
            })
        );

        // Hand-written point whose first field is a LONG.
        let bytes = [WireType::IndexedEntity.tag(), 30, 4, 2, 3, 4];
        assert!(matches!(
            codec.decode(&bytes),
            Err(WireError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_expected_rejects_other_tags() {
        let codec = WireCodec::default();
        let bytes = codec.encode(&Value::Long(1)).unwrap();
        assert!(codec.decode_expected(&bytes, WireType::Long).is_ok());
        assert_eq!(
            codec.decode_expected(&bytes, WireType::Int),
            Err(WireError::TypeMismatch {
                expected: WireType::Int,
                found: WireType::Long
            })
        );
    }

    #[test]
    fn test_unknown_entity_and_tag() {
        let codec = WireCodec::default();
        assert_eq!(codec.decode(&[21, 99, 0]), Err(WireError::UnknownEntity(99)));
        assert_eq!(codec.decode(&[24]), Err(WireError::UnknownTag(24)));
        assert_eq!(codec.decode(&[0xFF]), Err(WireError::UnknownTag(0xFF)));
    }

    #[test]
    fn test_length_prefix_checked_before_allocation() {
        let codec = WireCodec::default();
        // STRING claiming 2^40 bytes.
        let mut buf = vec![WireType::String.tag()];
        put_uvarint(&mut buf, 1 << 40);
        assert!(matches!(
            codec.decode(&buf),
            Err(WireError::InvalidLength { .. })
        ));

        // LONG_ARRAY claiming more elements than bytes remain.
        let buf = [WireType::LongArray.tag(), 100, 1];
        assert!(matches!(
            codec.decode(&buf),
            Err(WireError::InvalidLength { .. })
        ));

        let small = WireCodec::default().with_max_length(2);
        assert!(small.encode(&Value::from("abc")).is_err());
    }

    #[test]
    fn test_invalid_scalars() {
        let codec = WireCodec::default();
        assert_eq!(codec.decode(&[8, 2]), Err(WireError::InvalidBool(2)));
        assert_eq!(codec.decode(&[17, 1, 0xFF]), Err(WireError::InvalidUtf8));
        let mut surrogate = vec![7u8];
        put_uvarint(&mut surrogate, 0xD800);
        assert_eq!(codec.decode(&surrogate), Err(WireError::InvalidChar(0xD800)));
        // SHORT that does not fit 16 bits.
        let mut wide = vec![2u8];
        put_svarint(&mut wide, 70_000);
        assert_eq!(codec.decode(&wide), Err(WireError::VarintOverflow));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let codec = WireCodec::default();
        assert_eq!(codec.decode(&[0, 0]), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn test_every_strict_prefix_fails() {
        let codec = codec_with_units();
        let value = Value::map(vec![
            (Value::from("k"), Value::DoubleArray(vec![1.0, 2.0])),
            (Value::Int(3), Value::list(vec![Value::Char('x'), Value::Null])),
        ]);
        let bytes = codec.encode(&value).unwrap();
        for cut in 0..bytes.len() {
            assert!(codec.decode(&bytes[..cut]).is_err(), "prefix {cut} decoded");
        }
    }

    #[test]
    fn test_nesting_limit() {
        let codec = WireCodec::default();
        let mut value = Value::Null;
        for _ in 0..=MAX_DEPTH {
            value = Value::list(vec![value]);
        }
        assert_eq!(codec.encode(&value), Err(WireError::TooDeep(MAX_DEPTH)));
    }

    fn leaf_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i8>().prop_map(Value::Byte),
            any::<i16>().prop_map(Value::Short),
            any::<i32>().prop_map(Value::Int),
            any::<i64>().prop_map(Value::Long),
            (-1.0e6f32..1.0e6f32).prop_map(Value::Float),
            any::<char>().prop_map(Value::Char),
            any::<bool>().prop_map(Value::Bool),
            ".{0,16}".prop_map(Value::String),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(|b| Value::Chunk(Bytes::from(b))),
        ]
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        leaf_strategy().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::list),
                prop::collection::vec((inner.clone(), inner), 0..4).prop_map(Value::map),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn decode_inverts_encode(value in value_strategy()) {
            let codec = WireCodec::default();
            let bytes = codec.encode(&value).unwrap();
            prop_assert_eq!(codec.decode(&bytes).unwrap(), value);
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let codec = WireCodec::default();
            let _ = codec.decode(&bytes);
        }
    }
}
