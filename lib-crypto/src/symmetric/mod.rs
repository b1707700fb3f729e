//! Symmetric cryptography: ChaCha20-Poly1305 AEAD.

pub mod chacha20;

pub use chacha20::*;
