//! Kademlia-inspired DHT node: XOR-distance routing, iterative lookup,
//! and a signed/encrypted value store, driven from a dedicated engine
//! thread behind [`runner::RunnerHandle`].
//!
//! Callers that only need the raw, unauthenticated key/value layer can
//! use [`dht::Dht`] directly; most embedders want [`secure::SecureDht`],
//! which adds signature verification and owner-addressed encryption on
//! top without changing the method surface.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod dht;
pub mod error;
pub mod id;
pub mod network;
pub mod node;
pub mod persist;
pub mod proxy;
pub mod routing;
pub mod runner;
pub mod search;
pub mod secure;
pub mod stats;
pub mod storage;
pub mod value;
pub mod wire;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::{RunnerConfig, Transport};
pub use crypto::{Certificate, CryptoProvider, DefaultCryptoProvider, Identity, PrivateKey, PublicKey};
pub use dht::{Dht, ListenEvent, ListenHandle};
pub use error::{ConfigError, DhtError};
pub use id::{Distance, IdHash, PkId};
pub use runner::{Runner, RunnerHandle};
pub use secure::{PlainValue, SecureDht};
pub use stats::StatsSnapshot;
pub use value::Value;
