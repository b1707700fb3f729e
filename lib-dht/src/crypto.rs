//! Signing, encryption, and certificate identity (spec.md §4.B).
//!
//! `spec.md` treats wire cryptography primitives as an external
//! `CryptoProvider` contract. This module defines that contract as a
//! trait plus a concrete implementation backed by `lib-crypto`'s Ed25519
//! signing and ChaCha20-Poly1305 AEAD primitives, with X25519 providing
//! the key agreement an ECIES-style "encrypt to a public key" put needs
//! (spec.md never names an algorithm for the encryption half, only the
//! observable contract: ciphertext readable only by the recipient).

use crate::id::IdHash;
use anyhow::{anyhow, Context, Result};
use lib_crypto::classical::ed25519::{ed25519_keypair, ed25519_sign, ed25519_verify};
use lib_crypto::kdf::hkdf::derive_keys;
use lib_crypto::symmetric::chacha20::{decrypt_data, encrypt_data};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret as XStaticSecret};
use zeroize::Zeroize;

const ECIES_INFO: &[u8] = b"lib-dht-ecies-v1";

/// A node's or owner's public key material: an Ed25519 verification key
/// for signatures and an X25519 agreement key for encryption.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub sign_pk: [u8; 32],
    pub agree_pk: [u8; 32],
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.sign_pk))
    }
}

impl PublicKey {
    /// The canonical DHT id for this key: SHA-1 of its DER-ish encoding
    /// (here, the concatenation of both raw key bytes — spec.md only
    /// pins the hash function and the fact that it covers the encoded
    /// public key, not a specific ASN.1 layout).
    pub fn fingerprint(&self) -> IdHash {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.sign_pk);
        buf.extend_from_slice(&self.agree_pk);
        IdHash::hash(&buf)
    }
}

/// Private half of an identity's keypair. Zeroized on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey {
    pub sign_sk: [u8; 32],
    pub agree_sk: [u8; 32],
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}

/// A parsed certificate: binds a public key to the `IdHash` derived from
/// it, optionally signed by an issuer. Trust-root policy for certificates
/// is out of scope (spec.md §1); this type only carries the parsed
/// material a caller's own policy can act on.
#[derive(Clone, Debug)]
pub struct Certificate {
    pub id: IdHash,
    pub public_key: PublicKey,
    pub der: Vec<u8>,
    pub issuer: Option<IdHash>,
}

/// An identity is the `(private_key, certificate)` pair spec.md §3
/// defines; either half may be absent for anonymous operation.
#[derive(Clone, Default)]
pub struct Identity {
    pub private_key: Option<PrivateKey>,
    pub certificate: Option<Certificate>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.certificate.as_ref().map(|c| c.public_key.clone())
    }

    pub fn node_id(&self) -> Option<IdHash> {
        self.certificate.as_ref().map(|c| c.id)
    }
}

/// The crypto contract the rest of the DHT calls through. Kept as a
/// trait so wire cryptography can be swapped without touching routing,
/// storage, or search code (spec.md §1 explicitly scopes the concrete
/// primitives out of this document).
pub trait CryptoProvider: Send + Sync {
    fn generate_identity(&self) -> (PrivateKey, PublicKey);
    fn sign(&self, key: &PrivateKey, data: &[u8]) -> Vec<u8>;
    fn verify(&self, key: &PublicKey, data: &[u8], signature: &[u8]) -> bool;
    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>>;
    /// Parse a DER-encoded X.509 certificate and derive its `IdHash`.
    fn parse_certificate(&self, der: &[u8]) -> Result<Certificate>;
}

/// Default `CryptoProvider`: Ed25519 for signatures, X25519 + HKDF +
/// ChaCha20-Poly1305 for public-key encryption.
#[derive(Default, Clone, Copy)]
pub struct DefaultCryptoProvider;

impl CryptoProvider for DefaultCryptoProvider {
    fn generate_identity(&self) -> (PrivateKey, PublicKey) {
        let (sign_pk_vec, sign_sk_vec) = ed25519_keypair();
        let mut sign_pk = [0u8; 32];
        let mut sign_sk = [0u8; 32];
        sign_pk.copy_from_slice(&sign_pk_vec);
        sign_sk.copy_from_slice(&sign_sk_vec);

        let agree_sk = XStaticSecret::random_from_rng(rand::rngs::OsRng);
        let agree_pk = XPublicKey::from(&agree_sk);

        (
            PrivateKey {
                sign_sk,
                agree_sk: agree_sk.to_bytes(),
            },
            PublicKey {
                sign_pk,
                agree_pk: agree_pk.to_bytes(),
            },
        )
    }

    fn sign(&self, key: &PrivateKey, data: &[u8]) -> Vec<u8> {
        ed25519_sign(data, &key.sign_sk).unwrap_or_default()
    }

    fn verify(&self, key: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
        ed25519_verify(data, signature, &key.sign_pk).unwrap_or(false)
    }

    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ephemeral_sk = XStaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_pk = XPublicKey::from(&ephemeral_sk);
        let recipient_pk = XPublicKey::from(recipient.agree_pk);
        let shared = ephemeral_sk.diffie_hellman(&recipient_pk);

        let aead_key = derive_keys(shared.as_bytes(), ECIES_INFO, 32)
            .context("deriving ECIES AEAD key")?;
        let ciphertext = encrypt_data(plaintext, &aead_key).context("encrypting value")?;

        let mut out = Vec::with_capacity(32 + ciphertext.len());
        out.extend_from_slice(ephemeral_pk.as_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 32 {
            return Err(anyhow!("ciphertext too short to contain ephemeral key"));
        }
        let mut ephemeral_pk_bytes = [0u8; 32];
        ephemeral_pk_bytes.copy_from_slice(&ciphertext[..32]);
        let ephemeral_pk = XPublicKey::from(ephemeral_pk_bytes);

        let our_sk = XStaticSecret::from(key.agree_sk);
        let shared = our_sk.diffie_hellman(&ephemeral_pk);

        let aead_key = derive_keys(shared.as_bytes(), ECIES_INFO, 32)
            .context("deriving ECIES AEAD key")?;
        decrypt_data(&ciphertext[32..], &aead_key).context("decrypting value")
    }

    fn parse_certificate(&self, der: &[u8]) -> Result<Certificate> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(der).context("parsing X.509 certificate")?;
        let spki_der = cert.public_key().raw;

        // Certificates in this DHT carry a raw concatenated Ed25519 +
        // X25519 public key in their SPKI field (see `PublicKey`'s own
        // encoding); a real CA-issued cert would instead carry a
        // standard SPKI `AlgorithmIdentifier`, which a production
        // CryptoProvider would need to branch on.
        if spki_der.len() < 64 {
            return Err(anyhow!("certificate public key too short"));
        }
        let mut sign_pk = [0u8; 32];
        let mut agree_pk = [0u8; 32];
        sign_pk.copy_from_slice(&spki_der[..32]);
        agree_pk.copy_from_slice(&spki_der[32..64]);
        let public_key = PublicKey { sign_pk, agree_pk };

        let issuer_der = cert.issuer().as_raw();
        let issuer = if issuer_der == cert.subject().as_raw() {
            None
        } else {
            Some(IdHash::hash(issuer_der))
        };

        Ok(Certificate {
            id: public_key.fingerprint(),
            public_key,
            der: der.to_vec(),
            issuer,
        })
    }
}

/// Generates a random 32-byte nonce, used by `Value::signable_bytes`
/// callers that need fresh randomness outside the AEAD path (e.g.
/// write-tokens, see `crate::network`).
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}
