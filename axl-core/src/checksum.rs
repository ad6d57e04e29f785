//! Frame checksums: CRC-32 with the IEEE polynomial.

#[inline]
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_detects_change() {
        assert_ne!(crc32(b"describe"), crc32(b"describf"));
    }
}
