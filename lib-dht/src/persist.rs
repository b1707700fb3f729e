//! On-disk snapshot of routing and identity state, built on `bincode`
//! with an explicit magic/version header so a future format change
//! degrades to "start fresh" instead of a hard crash.

use crate::crypto::{Certificate, Identity, PrivateKey, PublicKey};
use crate::id::IdHash;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::warn;

const MAGIC: [u8; 4] = *b"LDHT";
const FORMAT_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct PersistedNode {
    id: [u8; 20],
    addr: SocketAddr,
    last_reply: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    sign_sk: [u8; 32],
    agree_sk: [u8; 32],
    sign_pk: [u8; 32],
    agree_pk: [u8; 32],
    cert_der: Vec<u8>,
    cert_id: [u8; 20],
    cert_issuer: Option<[u8; 20]>,
}

#[derive(Serialize, Deserialize)]
struct PersistedValue {
    key: [u8; 20],
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedState {
    identity: Option<PersistedIdentity>,
    nodes: Vec<PersistedNode>,
    values: Vec<PersistedValue>,
}

/// What [`load`] recovers from disk: an optional identity to restore,
/// seed nodes to re-insert into a fresh routing table, and raw
/// bincode-serialized `Value` blobs to re-insert into storage.
#[derive(Default)]
pub struct RestoredState {
    pub identity: Option<Identity>,
    pub nodes: Vec<(IdHash, SocketAddr, u64)>,
    pub values: Vec<(IdHash, Vec<u8>)>,
}

pub fn save(path: &Path, identity: &Identity, nodes: &[(IdHash, SocketAddr, u64)], values: &[(IdHash, Vec<u8>)]) -> Result<()> {
    let persisted_identity = identity.private_key.as_ref().zip(identity.certificate.as_ref()).map(|(sk, cert)| PersistedIdentity {
        sign_sk: sk.sign_sk,
        agree_sk: sk.agree_sk,
        sign_pk: cert.public_key.sign_pk,
        agree_pk: cert.public_key.agree_pk,
        cert_der: cert.der.clone(),
        cert_id: cert.id.0,
        cert_issuer: cert.issuer.map(|i| i.0),
    });

    let state = PersistedState {
        identity: persisted_identity,
        nodes: nodes.iter().map(|(id, addr, last_reply)| PersistedNode { id: id.0, addr: *addr, last_reply: *last_reply }).collect(),
        values: values.iter().map(|(key, data)| PersistedValue { key: key.0, data: data.clone() }).collect(),
    };

    let body = bincode::serialize(&state).context("serializing persisted state")?;
    let mut out = Vec::with_capacity(body.len() + 6);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&body);

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &out).with_context(|| format!("writing {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Load a persisted state file. Any recognizable corruption or a
/// mismatched format version is treated as "nothing to restore" rather
/// than a fatal error — a DHT node with no prior state simply rejoins
/// the network fresh.
pub fn load(path: &Path) -> Result<RestoredState> {
    if !path.exists() {
        return Ok(RestoredState::default());
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() < 6 || bytes[..4] != MAGIC {
        warn!(path = %path.display(), "persisted state missing magic header, ignoring");
        return Ok(RestoredState::default());
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        warn!(path = %path.display(), version, "persisted state format version mismatch, ignoring");
        return Ok(RestoredState::default());
    }

    let state: PersistedState = match bincode::deserialize(&bytes[6..]) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "persisted state is corrupt, ignoring");
            return Ok(RestoredState::default());
        }
    };

    let identity = state.identity.map(|p| Identity {
        private_key: Some(PrivateKey { sign_sk: p.sign_sk, agree_sk: p.agree_sk }),
        certificate: Some(Certificate {
            id: IdHash(p.cert_id),
            public_key: PublicKey { sign_pk: p.sign_pk, agree_pk: p.agree_pk },
            der: p.cert_der,
            issuer: p.cert_issuer.map(IdHash),
        }),
    });

    Ok(RestoredState {
        identity,
        nodes: state.nodes.into_iter().map(|n| (IdHash(n.id), n.addr, n.last_reply)).collect(),
        values: state.values.into_iter().map(|v| (IdHash(v.key), v.data)).collect(),
    })
}

pub fn require_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            bail!("persist path parent directory does not exist: {}", parent.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, DefaultCryptoProvider};

    #[test]
    fn save_and_load_roundtrip_identity_and_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        let provider = DefaultCryptoProvider;
        let (sk, pk) = provider.generate_identity();
        let identity = Identity {
            private_key: Some(sk),
            certificate: Some(Certificate { id: pk.fingerprint(), public_key: pk, der: vec![1, 2, 3], issuer: None }),
        };
        let nodes = vec![(IdHash::hash(b"n1"), "127.0.0.1:4000".parse().unwrap(), 42u64)];
        let values = vec![(IdHash::hash(b"k1"), vec![9, 9, 9])];

        save(&path, &identity, &nodes, &values).unwrap();
        let restored = load(&path).unwrap();

        assert!(restored.identity.is_some());
        assert_eq!(restored.nodes, nodes);
        assert_eq!(restored.values, values);
    }

    #[test]
    fn load_on_missing_file_returns_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.bin");
        let restored = load(&path).unwrap();
        assert!(restored.identity.is_none());
        assert!(restored.nodes.is_empty());
    }

    #[test]
    fn load_on_corrupt_file_degrades_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.bin");
        std::fs::write(&path, b"not a real state file").unwrap();
        let restored = load(&path).unwrap();
        assert!(restored.identity.is_none());
    }

    #[test]
    fn load_on_version_mismatch_degrades_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.bin");
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&999u16.to_be_bytes());
        bytes.extend_from_slice(&[0, 1, 2, 3]);
        std::fs::write(&path, &bytes).unwrap();
        let restored = load(&path).unwrap();
        assert!(restored.nodes.is_empty());
    }
}
