//! The versioned record stored in the DHT (spec.md §3, §4.J).

use crate::crypto::{random_bytes, CryptoProvider, PublicKey};
use crate::id::IdHash;
use serde::{Deserialize, Serialize};

/// A value stored under some `IdHash` key.
///
/// Invariants (enforced by callers at the layer that can check them —
/// `SecureDht` for signature/encryption, `Storage` for id/overwrite
/// rules):
/// - if `owner` is set, `signature` must verify `data` under `owner`
/// - if `recipient` is set, `data` is opaque ciphertext to this node
/// - `id == 0` on submission means "auto-assign a fresh id"
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Value {
    pub id: u64,
    pub type_id: u32,
    pub data: Vec<u8>,
    pub user_type: String,
    pub owner: Option<PublicKey>,
    pub recipient: Option<IdHash>,
    pub signature: Option<Vec<u8>>,
    pub creation_time: u64,
}

impl Value {
    pub fn new(type_id: u32, data: Vec<u8>, user_type: impl Into<String>, creation_time: u64) -> Self {
        Value {
            id: 0,
            type_id,
            data,
            user_type: user_type.into(),
            owner: None,
            recipient: None,
            signature: None,
            creation_time,
        }
    }

    /// Resolve `id` if it is still 0 ("auto-assign", spec.md §3), so the
    /// caller learns the id the value will be addressable by before it
    /// ever reaches storage. A no-op if `id` is already set.
    pub fn resolve_id(&mut self) -> u64 {
        if self.id == 0 {
            let candidate = u64::from_be_bytes(random_bytes::<8>());
            self.id = if candidate == 0 { 1 } else { candidate };
        }
        self.id
    }

    /// Bytes signed over: `type_id || recipient || data || creation_time`
    /// (spec.md §4.J "Signed put").
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 32);
        buf.extend_from_slice(&self.type_id.to_be_bytes());
        match &self.recipient {
            Some(r) => buf.extend_from_slice(&r.0),
            None => buf.extend_from_slice(&[0u8; crate::id::ID_BYTES]),
        }
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.creation_time.to_be_bytes());
        buf
    }

    /// Verify `signature` against `owner` if both are present. Returns
    /// `true` if there is nothing to verify (no owner set — an
    /// unsigned/anonymous value), `false` if a signature is missing or
    /// does not verify.
    pub fn verify_signature(&self, crypto: &dyn CryptoProvider) -> bool {
        match (&self.owner, &self.signature) {
            (Some(owner), Some(sig)) => crypto.verify(owner, &self.signable_bytes(), sig),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.data.len() + self.user_type.len() + 64
    }

    /// Approximate on-wire/in-storage size used for the global byte
    /// budget (spec.md §4.G).
    pub fn storage_size(&self) -> usize {
        self.byte_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptoProvider;

    #[test]
    fn unsigned_value_verifies_trivially() {
        let v = Value::new(1, b"hi".to_vec(), "text", 0);
        assert!(v.verify_signature(&DefaultCryptoProvider));
    }

    #[test]
    fn signed_value_roundtrip() {
        let provider = DefaultCryptoProvider;
        let (sk, pk) = provider.generate_identity();
        let mut v = Value::new(1, b"hi".to_vec(), "text", 42);
        v.owner = Some(pk);
        v.signature = Some(provider.sign(&sk, &v.signable_bytes()));
        assert!(v.verify_signature(&provider));
    }

    #[test]
    fn tampered_value_fails_verification() {
        let provider = DefaultCryptoProvider;
        let (sk, pk) = provider.generate_identity();
        let mut v = Value::new(1, b"hi".to_vec(), "text", 42);
        v.owner = Some(pk);
        v.signature = Some(provider.sign(&sk, &v.signable_bytes()));
        v.data = b"tampered".to_vec();
        assert!(!v.verify_signature(&provider));
    }

    #[test]
    fn owner_without_signature_fails() {
        let provider = DefaultCryptoProvider;
        let (_sk, pk) = provider.generate_identity();
        let mut v = Value::new(1, b"hi".to_vec(), "text", 42);
        v.owner = Some(pk);
        assert!(!v.verify_signature(&provider));
    }
}
