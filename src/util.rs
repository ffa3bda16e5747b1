//! Utility modules shared by the codec and the index writer.

pub mod packed;
pub mod rate_limiter;
pub mod varint;

/// Render a generation or counter in base 36, as used in file names.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Parse a base 36 string produced by [`to_base36`].
pub fn from_base36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(10), "a");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36("10"), Some(36));
        assert_eq!(from_base36(&to_base36(123_456_789)), Some(123_456_789));
        assert_eq!(from_base36(""), None);
        assert_eq!(from_base36("_x"), None);
    }
}
