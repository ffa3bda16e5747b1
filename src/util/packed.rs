//! Fixed-width bit packing for doc values columns and pointers.
//!
//! Values are laid out little-endian, bit by bit, so the `i`-th value of a
//! `bits`-wide array starts at bit `i * bits`.

/// Number of bits needed to represent `max_value`.
pub fn bits_required(max_value: u64) -> u8 {
    (64 - max_value.leading_zeros()) as u8
}

/// Pack `values` using `bits` bits each.
pub fn pack(values: &[u64], bits: u8) -> Vec<u8> {
    let total_bits = values.len() as u64 * bits as u64;
    let mut out = vec![0u8; total_bits.div_ceil(8) as usize];
    if bits == 0 {
        return out;
    }
    let mask = mask(bits);
    for (i, &value) in values.iter().enumerate() {
        let mut v = value & mask;
        let mut bit_pos = i as u64 * bits as u64;
        let mut remaining = bits as u32;
        while remaining > 0 {
            let byte = (bit_pos / 8) as usize;
            let shift = (bit_pos % 8) as u32;
            let take = remaining.min(8 - shift);
            out[byte] |= ((v & ((1u64 << take) - 1)) << shift) as u8;
            v >>= take;
            bit_pos += take as u64;
            remaining -= take;
        }
    }
    out
}

/// Read the `index`-th value from a packed array.
///
/// Reads past the end of `data` yield zero bits.
pub fn get(data: &[u8], bits: u8, index: usize) -> u64 {
    if bits == 0 {
        return 0;
    }
    let mut bit_pos = index as u64 * bits as u64;
    let mut remaining = bits as u32;
    let mut result = 0u64;
    let mut filled = 0u32;
    while remaining > 0 {
        let byte = (bit_pos / 8) as usize;
        let shift = (bit_pos % 8) as u32;
        let take = remaining.min(8 - shift);
        let raw = data.get(byte).copied().unwrap_or(0) as u64;
        result |= ((raw >> shift) & ((1u64 << take) - 1)) << filled;
        filled += take;
        bit_pos += take as u64;
        remaining -= take;
    }
    result
}

/// Byte length of `count` values packed with `bits` bits.
pub fn packed_len(count: usize, bits: u8) -> usize {
    (count as u64 * bits as u64).div_ceil(8) as usize
}

fn mask(bits: u8) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}
