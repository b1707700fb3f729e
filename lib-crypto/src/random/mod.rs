//! Random number generation for cryptographic operations.

use rand::rngs::OsRng;
use rand::RngCore;

/// Generate a 12-byte nonce for ChaCha20-Poly1305.
pub fn generate_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_distinct() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
