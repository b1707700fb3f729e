//! Cryptography foundation crate: the concrete primitives backing
//! `lib_dht`'s `CryptoProvider` contract (Ed25519 signing, ChaCha20-Poly1305
//! AEAD, BLAKE3 hashing, HKDF key derivation). X25519 key agreement is
//! drawn directly from `x25519-dalek` at the call site in `lib_dht::crypto`
//! rather than wrapped here, since it has no other consumer in this crate.

pub mod classical;
pub mod hashing;
pub mod kdf;
pub mod random;
pub mod symmetric;

pub use hashing::hash_blake3;
