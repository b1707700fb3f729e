//! Key derivation: HKDF over SHA-3.

pub mod hkdf;

pub use hkdf::derive_keys;
