//! Runner configuration (spec.md §1 ambient stack, mirroring the
//! teacher's `zhtp::config` pattern: a serde-derived struct with a
//! `Default` impl that pins the spec's fixed constants, overridable by
//! whatever the embedding application loads at startup).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::node::{MAX_CONSECUTIVE_TIMEOUTS, MAX_RESPONSE_TIME_SECS, NODE_EXPIRE_TIME_SECS, NODE_GOOD_TIME_SECS};
use crate::routing::{BUCKET_REFRESH_INTERVAL_SECS, K};
use crate::search::ALPHA;
use crate::storage::{MAX_VALUES_PER_HASH, VALUE_DEFAULT_TTL_SECS};

/// How this node reaches the network: a full Kademlia peer binding its
/// own UDP sockets, or a thin client proxying through an HTTP gateway
/// (spec.md §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Transport {
    Udp {
        bind_v4: SocketAddr,
        bind_v6: Option<SocketAddr>,
    },
    Proxy {
        proxy_url: String,
    },
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Udp {
            bind_v4: "0.0.0.0:4222".parse().unwrap(),
            bind_v6: None,
        }
    }
}

/// Top-level configuration for a `Runner`. Every tunable the spec pins
/// to a fixed constant is still represented as a field here (rather than
/// hardcoded) so an embedding application can override it for testing or
/// for an unusually constrained deployment, while `Default` reproduces
/// the spec's fixed values exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub transport: Transport,
    pub bootstrap: Vec<SocketAddr>,
    pub persist_path: Option<PathBuf>,

    pub replication_factor: usize,
    pub lookup_concurrency: usize,
    pub bucket_refresh_interval: Duration,

    pub node_good_time: Duration,
    pub node_expire_time: Duration,
    pub response_timeout: Duration,
    pub max_consecutive_timeouts: u32,

    pub value_default_ttl: Duration,
    pub max_values_per_hash: usize,
    pub storage_byte_budget: usize,

    /// If true, this node relays messages on behalf of peers it cannot
    /// otherwise verify storage permission for (spec.md §4.K
    /// `forwardAllMessages`). Off by default: a node only forwards
    /// traffic it can account against its own permission policy.
    pub forward_all_messages: bool,

    /// Periodic maintenance tick (bucket refresh, expiry sweep,
    /// permanent re-announce) (spec.md §4.F).
    pub periodic_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            transport: Transport::default(),
            bootstrap: Vec::new(),
            persist_path: None,

            replication_factor: K,
            lookup_concurrency: ALPHA,
            bucket_refresh_interval: Duration::from_secs(BUCKET_REFRESH_INTERVAL_SECS),

            node_good_time: Duration::from_secs(NODE_GOOD_TIME_SECS),
            node_expire_time: Duration::from_secs(NODE_EXPIRE_TIME_SECS),
            response_timeout: Duration::from_secs(MAX_RESPONSE_TIME_SECS),
            max_consecutive_timeouts: MAX_CONSECUTIVE_TIMEOUTS,

            value_default_ttl: Duration::from_secs(VALUE_DEFAULT_TTL_SECS),
            max_values_per_hash: MAX_VALUES_PER_HASH,
            storage_byte_budget: 64 * 1024 * 1024,

            forward_all_messages: false,
            periodic_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_pins_spec_constants() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.replication_factor, K);
        assert_eq!(cfg.lookup_concurrency, ALPHA);
        assert_eq!(cfg.node_good_time, Duration::from_secs(NODE_GOOD_TIME_SECS));
    }
}
