//! CRC-32 helpers.
//!
//! Chunk checksums are plain CRC-32 over the chunk content. Appends extend an
//! existing checksum without re-reading the old bytes by combining it with
//! the checksum of the appended region.

use crc32fast::Hasher;

/// Checksum of a byte slice.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Checksum of `first || second`, given the checksum of each part and the
/// length of the second.
pub fn combine(first: u32, second: u32, second_len: u64) -> u32 {
    let mut hasher = Hasher::new_with_initial(first);
    hasher.combine(&Hasher::new_with_initial_len(second, second_len));
    hasher.finalize()
}

/// Checksum of `len` zero bytes.
pub fn zeros(len: u64) -> u32 {
    const BLOCK: [u8; 4096] = [0u8; 4096];

    let mut hasher = Hasher::new();
    let mut remaining = len;
    while remaining > 0 {
        let step = remaining.min(BLOCK.len() as u64) as usize;
        hasher.update(&BLOCK[..step]);
        remaining -= step as u64;
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_matches_concatenation() {
        let a = b"hello, ";
        let b = b"world";
        let combined = combine(checksum(a), checksum(b), b.len() as u64);
        assert_eq!(combined, checksum(b"hello, world"));
    }

    #[test]
    fn test_combine_with_empty() {
        let a = checksum(b"data");
        assert_eq!(combine(a, 0, 0), a);
        assert_eq!(combine(0, a, 4), a);
    }

    #[test]
    fn test_zeros() {
        assert_eq!(zeros(0), 0);
        assert_eq!(zeros(10_000), checksum(&vec![0u8; 10_000]));
    }
}
