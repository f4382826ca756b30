//! Content hashing.

use sha2::{Digest, Sha256};

/// SHA-256 of `bytes`, rendered as 64 lowercase hex characters.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Cheap 32-bit string hash (`h * 31 + c`), for log correlation only.
pub fn string_hash32(s: &str) -> u32 {
    s.chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(content_hash(b"").len(), 64);
    }

    #[test]
    fn string_hash_is_stable() {
        assert_eq!(string_hash32("a"), 97);
        assert_eq!(string_hash32("ab"), 97 * 31 + 98);
        assert_eq!(string_hash32("https://x"), string_hash32("https://x"));
    }
}
