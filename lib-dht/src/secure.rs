//! Signed and encrypted value pipeline on top of the raw [`Dht`]
//! (spec.md §4.J, §4.K). Certificates are published under the canonical
//! key `"pk:<owner id>"` so any peer can resolve a public key the same
//! way it resolves any other stored value — no separate certificate
//! protocol is needed on the wire.

use crate::clock::Timestamp;
use crate::crypto::{Certificate, CryptoProvider, Identity, PublicKey};
use crate::dht::{Dht, ListenEvent, ListenHandle};
use crate::error::DhtError;
use crate::id::IdHash;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

fn canonical_pk_key(owner: &IdHash) -> IdHash {
    let mut buf = Vec::with_capacity(3 + 20);
    buf.extend_from_slice(b"pk:");
    buf.extend_from_slice(&owner.0);
    IdHash::hash(&buf)
}

/// A value returned from [`SecureDht::get`], already verified and (if it
/// was addressed to us) decrypted.
#[derive(Debug, Clone)]
pub struct PlainValue {
    pub owner: Option<IdHash>,
    pub user_type: String,
    pub data: Vec<u8>,
    pub creation_time: Timestamp,
}

pub struct SecureDht {
    dht: Dht,
    identity: Identity,
    crypto: Arc<dyn CryptoProvider>,
    cert_cache: HashMap<IdHash, Certificate>,
    /// Whether `get` discards unsigned values rather than returning them
    /// alongside signed ones (spec.md §4.K, an Open Question resolved in
    /// `DESIGN.md`: this is a per-node policy, not a protocol-level rule).
    pub require_signed: bool,
}

impl SecureDht {
    pub fn new(dht: Dht, identity: Identity, crypto: Arc<dyn CryptoProvider>) -> Self {
        SecureDht {
            dht,
            identity,
            crypto,
            cert_cache: HashMap::new(),
            require_signed: false,
        }
    }

    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    pub fn dht_mut(&mut self) -> &mut Dht {
        &mut self.dht
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Replace this node's identity, e.g. after loading one back from
    /// persisted state at startup (spec.md §6 "Persisted state layout").
    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = identity;
    }

    /// Publish this node's own certificate so others can resolve its
    /// public key via `find_public_key`. A no-op for anonymous nodes.
    pub async fn publish_identity(&mut self) -> Result<(), DhtError> {
        let cert = match &self.identity.certificate {
            Some(c) => c.clone(),
            None => return Ok(()),
        };
        let key = canonical_pk_key(&cert.id);
        let value = Value::new(CERT_TYPE_ID, cert.der.clone(), "certificate", self.dht.local_now());
        self.dht.put(key, value, None).await?;
        Ok(())
    }

    pub async fn find_public_key(&mut self, owner: IdHash) -> Result<PublicKey, DhtError> {
        if let Some(cert) = self.cert_cache.get(&owner) {
            return Ok(cert.public_key.clone());
        }
        let key = canonical_pk_key(&owner);
        let values = self.dht.get(key).await?;
        for v in values {
            if v.user_type != "certificate" {
                continue;
            }
            if let Ok(cert) = self.crypto.parse_certificate(&v.data) {
                if cert.id == owner {
                    self.cert_cache.insert(owner, cert.clone());
                    return Ok(cert.public_key);
                }
            }
        }
        Err(DhtError::SearchFailed { target: owner })
    }

    /// Store `data` signed by this node's identity. Requires a private
    /// key and certificate (spec.md §4.J "Signed put").
    pub async fn put_signed(&mut self, key: IdHash, data: Vec<u8>, user_type: &str, ttl: Option<Duration>) -> Result<u64, DhtError> {
        let private_key = self
            .identity
            .private_key
            .as_ref()
            .ok_or_else(|| DhtError::PermissionDenied { reason: "no private key configured".into() })?;
        let public_key = self
            .identity
            .public_key()
            .ok_or_else(|| DhtError::PermissionDenied { reason: "no certificate configured".into() })?;

        let now = self.dht.local_now();
        let mut value = Value::new(0, data, user_type, now);
        value.owner = Some(public_key);
        value.signature = Some(self.crypto.sign(private_key, &value.signable_bytes()));
        self.dht.put(key, value, ttl).await
    }

    /// Store `data` readable only by `recipient`. If this node has an
    /// identity, the ciphertext is also signed so the recipient can
    /// verify who sent it (spec.md §4.K "Encrypted direct message").
    pub async fn put_encrypted(&mut self, key: IdHash, data: Vec<u8>, user_type: &str, recipient: IdHash, ttl: Option<Duration>) -> Result<u64, DhtError> {
        let recipient_key = self.find_public_key(recipient).await?;
        let ciphertext = self
            .crypto
            .encrypt(&recipient_key, &data)
            .map_err(|e| DhtError::ValueRejected { reason: e.to_string() })?;

        let now = self.dht.local_now();
        let mut value = Value::new(0, ciphertext, user_type, now);
        value.recipient = Some(recipient);
        if let (Some(sk), Some(pk)) = (&self.identity.private_key, self.identity.public_key()) {
            value.owner = Some(pk);
            value.signature = Some(self.crypto.sign(sk, &value.signable_bytes()));
        }
        self.dht.put(key, value, ttl).await
    }

    pub async fn put_unsigned(&mut self, key: IdHash, data: Vec<u8>, user_type: &str, ttl: Option<Duration>) -> Result<u64, DhtError> {
        let now = self.dht.local_now();
        let value = Value::new(0, data, user_type, now);
        self.dht.put(key, value, ttl).await
    }

    /// Fetch and verify every value stored under `key`. Values whose
    /// signature does not verify are dropped with a warning rather than
    /// surfaced — a forged value is not a search failure, it is noise.
    /// Values addressed to this node (`recipient == own_id`) are
    /// decrypted before being returned.
    pub async fn get(&mut self, key: IdHash) -> Result<Vec<PlainValue>, DhtError> {
        let raw = self.dht.get(key).await?;
        verify_and_decrypt(key, raw, &self.identity, self.crypto.as_ref(), self.require_signed)
    }

    pub fn listen(&mut self, key: IdHash) -> (ListenHandle, tokio::sync::mpsc::UnboundedReceiver<ListenEvent>) {
        self.dht.listen(key)
    }

    pub fn cancel_listen(&mut self, handle: ListenHandle) {
        self.dht.cancel_listen(handle)
    }

    /// Cancel a pending or already-stored put (spec.md §4.I). See
    /// `Dht::cancel_put` for what this does and does not reach.
    pub fn cancel_put(&mut self, key: IdHash, value_id: u64) {
        self.dht.cancel_put(key, value_id)
    }
}

const CERT_TYPE_ID: u32 = 0xCE27_0001;

/// Shared verify/decrypt pass used both by [`SecureDht::get`] and by the
/// `Runner`'s proxy-mode get path (spec.md §7 requires the proxy client
/// to present the same verified-value contract a direct node does).
pub(crate) fn verify_and_decrypt(
    key: IdHash,
    raw: Vec<Value>,
    identity: &Identity,
    crypto: &dyn CryptoProvider,
    require_signed: bool,
) -> Result<Vec<PlainValue>, DhtError> {
    let own_id = identity.node_id();
    let mut out = Vec::new();

    for value in raw {
        if !value.verify_signature(crypto) {
            warn!(key = %key, "dropping value with invalid signature");
            continue;
        }
        if require_signed && value.owner.is_none() {
            continue;
        }

        let owner = value.owner.as_ref().map(|pk| pk.fingerprint());
        let data = match value.recipient {
            Some(recipient) if Some(recipient) == own_id => {
                let private_key = match &identity.private_key {
                    Some(sk) => sk,
                    None => {
                        warn!(key = %key, "value addressed to us but we have no private key");
                        continue;
                    }
                };
                match crypto.decrypt(private_key, &value.data) {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to decrypt value addressed to us");
                        continue;
                    }
                }
            }
            Some(_) => continue, // addressed to someone else: opaque to us
            None => value.data,
        };

        out.push(PlainValue { owner, user_type: value.user_type, data, creation_time: value.creation_time });
    }

    if out.is_empty() {
        return Err(DhtError::SearchFailed { target: key });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crypto::DefaultCryptoProvider;
    use crate::stats::Stats;

    async fn node() -> Dht {
        let id = IdHash::random();
        Dht::new(id, "127.0.0.1:0".parse().unwrap(), None, 1_000_000, Arc::new(SystemClock), Arc::new(Stats::default()))
            .await
            .unwrap()
    }

    fn identity_with_keys(provider: &DefaultCryptoProvider) -> (Identity, IdHash) {
        let (sk, pk) = provider.generate_identity();
        let id = pk.fingerprint();
        let identity = Identity {
            private_key: Some(sk),
            certificate: Some(Certificate { id, public_key: pk, der: vec![], issuer: None }),
        };
        (identity, id)
    }

    #[tokio::test]
    async fn signed_put_and_get_roundtrip_single_node() {
        let provider: Arc<dyn CryptoProvider> = Arc::new(DefaultCryptoProvider);
        let (identity, _id) = identity_with_keys(&DefaultCryptoProvider);
        let mut secure = SecureDht::new(node().await, identity, provider);

        let key = IdHash::hash(b"doc");
        secure.put_signed(key, b"hello world".to_vec(), "text", Some(Duration::from_secs(60))).await.unwrap();
        let got = secure.get(key).await.unwrap();
        assert_eq!(got[0].data, b"hello world");
        assert!(got[0].owner.is_some());
    }

    #[tokio::test]
    async fn tampered_storage_is_rejected_on_read() {
        let provider: Arc<dyn CryptoProvider> = Arc::new(DefaultCryptoProvider);
        let (identity, _id) = identity_with_keys(&DefaultCryptoProvider);
        let mut secure = SecureDht::new(node().await, identity, provider);

        let key = IdHash::hash(b"doc");
        secure.put_signed(key, b"hello world".to_vec(), "text", Some(Duration::from_secs(60))).await.unwrap();

        // Tamper directly in the underlying raw storage.
        secure.dht_mut().test_corrupt_first(&key, b"forged".to_vec());
        let result = secure.get(key).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn encrypted_put_is_unreadable_without_the_recipient_key() {
        let provider: Arc<dyn CryptoProvider> = Arc::new(DefaultCryptoProvider);
        let (sender_identity, _sender_id) = identity_with_keys(&DefaultCryptoProvider);
        let (recipient_identity, recipient_id) = identity_with_keys(&DefaultCryptoProvider);

        let shared_dht = node().await;
        let mut sender = SecureDht::new(shared_dht, sender_identity, provider.clone());

        // Publish the recipient's certificate into the sender's own view
        // directly via the cache (single-process test; no real network
        // certificate exchange happens here).
        if let Some(cert) = recipient_identity.certificate.clone() {
            sender.cert_cache.insert(recipient_id, cert);
        }

        let key = IdHash::hash(b"secret-doc");
        sender.put_encrypted(key, b"top secret".to_vec(), "text", recipient_id, Some(Duration::from_secs(60))).await.unwrap();

        // The sender itself cannot decrypt it (not the recipient).
        let as_sender = sender.get(key).await;
        assert!(as_sender.is_err() || as_sender.unwrap().is_empty());
    }
}
