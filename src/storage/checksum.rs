//! CRC32C checksums for page payloads (spec.md #3 "Checksum").
//!
//! The teacher dispatches to a hardware (SSE4.2) CRC32C with a software
//! fallback; this crate pulls in the `crc32c` crate instead of hand-rolling
//! the SIMD intrinsics (see DESIGN.md) and keeps a thin wrapper so callers
//! don't care which backend computed the value.

/// Checksum of a page's payload bytes, excluding the checksum field itself.
#[inline]
pub fn page_checksum(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// Verify a payload against a previously stored checksum.
#[inline]
pub fn verify(payload: &[u8], expected: u32) -> bool {
    page_checksum(payload) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let data = b"hamsterdb-style page payload";
        assert_eq!(page_checksum(data), page_checksum(data));
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut data = b"page payload bytes".to_vec();
        let sum = page_checksum(&data);
        data[3] ^= 0xFF;
        assert!(!verify(&data, sum));
    }
}
