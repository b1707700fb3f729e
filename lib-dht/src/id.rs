//! 160-bit identifiers, the 32-byte key-fingerprint variant, and the XOR
//! distance metric the whole routing layer is built on.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Number of bits in an [`IdHash`], and the number of k-buckets a fully
/// split routing table can have.
pub const ID_BITS: usize = 160;
pub const ID_BYTES: usize = 20;

/// 160-bit DHT identifier: node ids and key hashes share this space.
///
/// A zero value (`IdHash::ZERO`) is the sentinel for "unset" used by
/// `Value::id == 0` meaning "auto-assign" at the value layer (that field
/// is a `u64`, not an `IdHash`, but the same zero-is-unset convention
/// applies to node ids that have not yet been learned).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdHash(pub [u8; ID_BYTES]);

impl IdHash {
    pub const ZERO: IdHash = IdHash([0u8; ID_BYTES]);

    /// Derive an id by hashing arbitrary bytes with the DHT's fixed
    /// cryptographic hash (SHA-1, matching the 160-bit key space this
    /// implementation shares with BitTorrent/Kademlia-style overlays).
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut out = [0u8; ID_BYTES];
        out.copy_from_slice(&digest);
        IdHash(out)
    }

    pub fn is_zero(&self) -> bool {
        *self == IdHash::ZERO
    }

    /// XOR distance to another id, interpreted as a 160-bit unsigned
    /// integer for ordering purposes.
    pub fn distance(&self, other: &IdHash) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Random id, used to pick a target inside a bucket's range for
    /// refresh lookups.
    pub fn random() -> Self {
        let mut out = [0u8; ID_BYTES];
        rand::Rng::fill(&mut rand::thread_rng(), &mut out);
        IdHash(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse exactly 40 hex characters. Odd-length or wrong-length input
    /// is rejected; a null-terminated prefix shorter than 40 chars (as
    /// produced by some C string buffers) is accepted by trimming at the
    /// first NUL.
    pub fn from_hex(s: &str) -> Result<Self, IdParseError> {
        let trimmed = s.split('\0').next().unwrap_or(s);
        if trimmed.len() != ID_BYTES * 2 {
            return Err(IdParseError::WrongLength(trimmed.len()));
        }
        if trimmed.len() % 2 != 0 {
            return Err(IdParseError::OddLength);
        }
        let bytes = hex::decode(trimmed).map_err(IdParseError::Hex)?;
        let mut out = [0u8; ID_BYTES];
        out.copy_from_slice(&bytes);
        Ok(IdHash(out))
    }

    /// Number of leading zero bits in the distance to `other`: this is
    /// the bucket-prefix depth at which `self` and `other` first diverge,
    /// and is the primary quantity the routing table buckets on.
    pub fn common_prefix_len(&self, other: &IdHash) -> usize {
        self.distance(other).leading_zero_bits()
    }
}

impl fmt::Debug for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdHash({})", self.to_hex())
    }
}

impl fmt::Display for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdParseError {
    #[error("expected 40 hex characters, got {0}")]
    WrongLength(usize),
    #[error("hex input has odd length")]
    OddLength,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// XOR distance between two [`IdHash`] values, ordered as a 160-bit
/// unsigned integer (most significant byte first).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Distance(pub [u8; ID_BYTES]);

impl Distance {
    pub fn leading_zero_bits(&self) -> usize {
        let mut count = 0;
        for byte in self.0.iter() {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count
    }

    pub const MAX: Distance = Distance([0xffu8; ID_BYTES]);
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// 32-byte identifier for longer-form public-key fingerprints (certificate
/// ids). Distinct type from [`IdHash`], same comparison semantics, used
/// where a key fingerprint needs more collision resistance than the
/// 160-bit DHT key space provides.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PkId(pub [u8; 32]);

impl PkId {
    pub const ZERO: PkId = PkId([0u8; 32]);

    pub fn hash(data: &[u8]) -> Self {
        let digest = lib_crypto::hash_blake3(data);
        PkId(digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PkId({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(IdHash::hash(b"hello"), IdHash::hash(b"hello"));
        assert_ne!(IdHash::hash(b"hello"), IdHash::hash(b"world"));
    }

    #[test]
    fn distance_is_symmetric_and_zero_for_self() {
        let a = IdHash::hash(b"a");
        let b = IdHash::hash(b"b");
        assert_eq!(a.distance(&a).leading_zero_bits(), ID_BITS);
        assert_eq!(a.distance(&b).0, b.distance(&a).0);
    }

    #[test]
    fn hex_roundtrip() {
        let id = IdHash::hash(b"roundtrip");
        let hex = id.to_hex();
        assert_eq!(IdHash::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn hex_rejects_wrong_length() {
        assert!(IdHash::from_hex("abcd").is_err());
        assert!(IdHash::from_hex(&"a".repeat(41)).is_err());
    }

    #[test]
    fn hex_accepts_null_terminated_prefix() {
        let id = IdHash::hash(b"nul-term");
        let mut s = id.to_hex();
        s.push('\0');
        s.push_str("garbage-after-nul");
        assert_eq!(IdHash::from_hex(&s).unwrap(), id);
    }

    #[test]
    fn common_prefix_len_matches_distance_leading_zeros() {
        let a = IdHash([0b1010_0000; ID_BYTES]);
        let mut b_bytes = a.0;
        b_bytes[0] = 0b0010_0000;
        let b = IdHash(b_bytes);
        assert_eq!(a.common_prefix_len(&b), 0);
        assert_eq!(a.common_prefix_len(&a), ID_BITS);
    }
}
