//! Classical (non-post-quantum) cryptography: Ed25519 signing.

pub mod ed25519;

pub use ed25519::*;
