//! LEB128 varints with zig-zag mapping for signed integers.

use bytes::{Buf, BufMut};

use crate::error::WireError;

/// Longest encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Write an unsigned varint.
pub fn put_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Write a signed varint (zig-zag).
#[inline]
pub fn put_svarint<B: BufMut>(buf: &mut B, value: i64) {
    put_uvarint(buf, zigzag_encode(value));
}

/// Read an unsigned varint.
pub fn get_uvarint<B: Buf>(buf: &mut B) -> Result<u64, WireError> {
    let mut result = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(WireError::Truncated { needed: 1 });
        }
        let byte = buf.get_u8();
        // The 10th byte may only carry the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(WireError::VarintOverflow);
        }
        result |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(WireError::VarintOverflow)
}

/// Read a signed varint (zig-zag).
#[inline]
pub fn get_svarint<B: Buf>(buf: &mut B) -> Result<i64, WireError> {
    get_uvarint(buf).map(zigzag_decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag_small_magnitudes_stay_small() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MIN)), i64::MIN);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MAX)), i64::MAX);
    }

    #[test]
    fn test_uvarint_lengths() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 127);
        assert_eq!(buf, vec![0x7F]);

        buf.clear();
        put_uvarint(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);

        buf.clear();
        put_uvarint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(get_uvarint(&mut &buf[..]).unwrap(), u64::MAX);
    }

    #[test]
    fn test_truncated_varint() {
        let buf = [0x80u8, 0x80];
        assert!(matches!(
            get_uvarint(&mut &buf[..]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_overlong_varint() {
        let buf = [0xFFu8; 11];
        assert_eq!(get_uvarint(&mut &buf[..]), Err(WireError::VarintOverflow));
    }
}
