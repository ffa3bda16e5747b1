//! Variable-length integer encoding utilities.
//!
//! Integers are written 7 bits per byte, least significant group first, with
//! the high bit set on every byte except the last.

use crate::error::{Result, TesseraError};

/// Append the variable-length encoding of `value` to `out`.
pub fn encode_u64_into(value: u64, out: &mut Vec<u8>) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if val == 0 {
            break;
        }
    }
}

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    encode_u64_into(value, &mut bytes);
    bytes
}

/// Decode a u64 value, returning it with the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(TesseraError::other("VarInt overflow"));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }

    Err(TesseraError::other("Incomplete VarInt"))
}

/// Map a signed value onto an unsigned one so small magnitudes stay short.
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_values_use_one_byte() {
        assert_eq!(encode_u64(0), vec![0]);
        assert_eq!(encode_u64(127), vec![127]);
        assert_eq!(encode_u64(128), vec![0x80, 0x01]);
    }

    #[test]
    fn test_decode() {
        let bytes = encode_u64(300);
        assert_eq!(decode_u64(&bytes).unwrap(), (300, 2));
        let bytes = encode_u64(u64::MAX);
        assert_eq!(bytes.len(), 10);
        assert_eq!(decode_u64(&bytes).unwrap(), (u64::MAX, 10));
    }

    #[test]
    fn test_incomplete() {
        assert!(decode_u64(&[0x80, 0x80]).is_err());
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        for v in [i64::MIN, -12345, 0, 77, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }
}
