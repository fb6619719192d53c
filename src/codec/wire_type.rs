//! One-byte wire tags.
//!
//! Every encoded value starts with a tag naming its shape:
//!
//! ```text
//! 0        NULL
//! 1..=8    BYTE SHORT INT LONG FLOAT DOUBLE CHAR BOOLEAN
//! 9..=16   arrays of the above, same order
//! 17       STRING
//! 18..=20  MESSAGE ENUM CHUNK
//! 21..=23  KEYED_ENTITY INDEXED_ENTITY CUSTOM_ENTITY
//! 24       RUN_TIME (descriptor-only, never on the wire)
//! ```

use crate::error::WireError;

/// Shape of an encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    Null = 0,
    Byte = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    Float = 5,
    Double = 6,
    Char = 7,
    Boolean = 8,
    ByteArray = 9,
    ShortArray = 10,
    IntArray = 11,
    LongArray = 12,
    FloatArray = 13,
    DoubleArray = 14,
    CharArray = 15,
    BooleanArray = 16,
    String = 17,
    Message = 18,
    Enum = 19,
    Chunk = 20,
    KeyedEntity = 21,
    IndexedEntity = 22,
    CustomEntity = 23,
    /// Resolve the tag from the value at encode time; accept any tag at decode time.
    RunTime = 24,
}

impl WireType {
    /// Tag byte written on the wire.
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parse a tag byte read from the wire.
    ///
    /// `RUN_TIME` is a descriptor sentinel, so reading it is an error.
    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        let ty = match tag {
            0 => WireType::Null,
            1 => WireType::Byte,
            2 => WireType::Short,
            3 => WireType::Int,
            4 => WireType::Long,
            5 => WireType::Float,
            6 => WireType::Double,
            7 => WireType::Char,
            8 => WireType::Boolean,
            9 => WireType::ByteArray,
            10 => WireType::ShortArray,
            11 => WireType::IntArray,
            12 => WireType::LongArray,
            13 => WireType::FloatArray,
            14 => WireType::DoubleArray,
            15 => WireType::CharArray,
            16 => WireType::BooleanArray,
            17 => WireType::String,
            18 => WireType::Message,
            19 => WireType::Enum,
            20 => WireType::Chunk,
            21 => WireType::KeyedEntity,
            22 => WireType::IndexedEntity,
            23 => WireType::CustomEntity,
            other => return Err(WireError::UnknownTag(other)),
        };
        Ok(ty)
    }

    /// Whether a decoded `found` tag satisfies this expected tag.
    ///
    /// NULL is accepted anywhere: any field may be absent.
    #[inline]
    pub fn accepts(self, found: WireType) -> bool {
        self == WireType::RunTime || found == WireType::Null || self == found
    }

    #[inline]
    pub fn is_primitive(self) -> bool {
        (1..=8).contains(&self.tag())
    }

    #[inline]
    pub fn is_array(self) -> bool {
        (9..=16).contains(&self.tag())
    }

    #[inline]
    pub fn is_entity(self) -> bool {
        (21..=23).contains(&self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_for_all_wire_tags() {
        for tag in 0u8..=23 {
            let ty = WireType::from_tag(tag).unwrap();
            assert_eq!(ty.tag(), tag);
        }
    }

    #[test]
    fn test_run_time_is_not_a_wire_tag() {
        assert_eq!(WireType::RunTime.tag(), 24);
        assert_eq!(WireType::from_tag(24), Err(WireError::UnknownTag(24)));
        assert_eq!(WireType::from_tag(200), Err(WireError::UnknownTag(200)));
    }

    #[test]
    fn test_ranges() {
        assert!(WireType::Byte.is_primitive());
        assert!(WireType::Boolean.is_primitive());
        assert!(!WireType::ByteArray.is_primitive());
        assert!(WireType::BooleanArray.is_array());
        assert!(WireType::KeyedEntity.is_entity());
        assert!(WireType::CustomEntity.is_entity());
        assert!(!WireType::String.is_entity());
    }

    #[test]
    fn test_accepts() {
        assert!(WireType::RunTime.accepts(WireType::Long));
        assert!(WireType::Int.accepts(WireType::Null));
        assert!(WireType::Int.accepts(WireType::Int));
        assert!(!WireType::Int.accepts(WireType::Long));
    }
}
