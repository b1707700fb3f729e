//! Hashing module for the cryptography foundation crate.
//!
//! BLAKE3 is the fast general-purpose hash used outside the DHT's fixed
//! SHA-1 key space (write-token derivation, listen dedup digests).

use blake3;

pub fn hash_blake3(data: &[u8]) -> [u8; 32] {
    let hash = blake3::hash(data);
    hash.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_32_bytes() {
        let data = b"hello world";
        let hash = hash_blake3(data);
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, hash_blake3(data));
    }
}
