//! Remote peer record and liveness tracking, following the timing model
//! OpenDHT's `node.h` uses for bucket maintenance.

use crate::clock::Timestamp;
use crate::id::IdHash;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Time a reply must have been received within for a node to count as
/// "good".
pub const NODE_GOOD_TIME_SECS: u64 = 120 * 60;

/// Time without a reply after which a node with pending requests becomes
/// expirable.
pub const NODE_EXPIRE_TIME_SECS: u64 = 10 * 60;

/// Per-request timeout.
pub const MAX_RESPONSE_TIME_SECS: u64 = 1;

/// Consecutive timeouts after which a node is marked expired outright.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// A pending request sent to this node, tracked so the node's liveness
/// state can be derived from how many are outstanding or have timed out.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub transaction_id: [u8; 4],
    pub sent_at: Timestamp,
    pub timed_out: bool,
}

/// A remote peer known to this node, as tracked by the routing table and
/// referenced (not owned) by in-flight searches.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: IdHash,
    pub addr: SocketAddr,
    /// Last time we heard anything from this node (a reply, or it
    /// contacting us).
    pub last_seen: Timestamp,
    /// Last time we received a *correct reply* from this node.
    pub last_reply: Timestamp,
    pending: VecDeque<PendingRequest>,
    consecutive_timeouts: u32,
    expired: bool,
}

impl Node {
    pub fn new(id: IdHash, addr: SocketAddr, now: Timestamp) -> Self {
        Node {
            id,
            addr,
            last_seen: now,
            last_reply: 0,
            pending: VecDeque::new(),
            consecutive_timeouts: 0,
            expired: false,
        }
    }

    /// A node is "good" if a reply has been received within
    /// `NODE_GOOD_TIME_SECS`.
    pub fn is_good(&self, now: Timestamp) -> bool {
        !self.expired && now.saturating_sub(self.last_reply) <= NODE_GOOD_TIME_SECS
    }

    /// A node is "expirable" if no reply for `NODE_EXPIRE_TIME_SECS` and
    /// it has pending requests outstanding.
    pub fn is_expirable(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_reply) > NODE_EXPIRE_TIME_SECS && self.has_pending()
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn set_expired(&mut self) {
        self.expired = true;
    }

    /// Un-expire a node: called when it replies again after having been
    /// marked expired, mirroring OpenDHT's `Node::reset()`.
    pub fn reset(&mut self) {
        self.expired = false;
        self.consecutive_timeouts = 0;
    }

    fn prune_pending(&mut self) {
        self.pending.retain(|p| !p.timed_out);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(|p| !p.timed_out)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.timed_out).count()
    }

    /// Record that a request was sent to this node.
    pub fn requested(&mut self, transaction_id: [u8; 4], now: Timestamp) {
        self.prune_pending();
        self.pending.push_back(PendingRequest {
            transaction_id,
            sent_at: now,
            timed_out: false,
        });
        self.last_seen = now;
    }

    /// Record a correct reply to one of our pending requests.
    pub fn record_reply(&mut self, transaction_id: [u8; 4], now: Timestamp) {
        self.pending.retain(|p| p.transaction_id != transaction_id);
        self.last_seen = now;
        self.last_reply = now;
        self.reset();
    }

    /// Record that a pending request timed out. Returns `true` if this
    /// pushed the node to `MAX_CONSECUTIVE_TIMEOUTS` and it is now
    /// expired.
    pub fn record_timeout(&mut self, transaction_id: [u8; 4]) -> bool {
        if let Some(p) = self
            .pending
            .iter_mut()
            .find(|p| p.transaction_id == transaction_id)
        {
            p.timed_out = true;
            self.consecutive_timeouts += 1;
        }
        if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
            self.expired = true;
            true
        } else {
            false
        }
    }

    /// Update the node's known address (e.g. after a STUN-style observed
    /// address report).
    pub fn update_addr(&mut self, addr: SocketAddr) {
        self.addr = addr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000)
    }

    #[test]
    fn fresh_node_is_not_good_until_a_reply_arrives() {
        let node = Node::new(IdHash::hash(b"n"), addr(), 1000);
        assert!(!node.is_good(1000));
    }

    #[test]
    fn node_good_within_window_after_reply() {
        let mut node = Node::new(IdHash::hash(b"n"), addr(), 0);
        node.record_reply([1, 2, 3, 4], 1000);
        assert!(node.is_good(1000 + NODE_GOOD_TIME_SECS));
        assert!(!node.is_good(1000 + NODE_GOOD_TIME_SECS + 1));
    }

    #[test]
    fn three_consecutive_timeouts_expire_a_node() {
        let mut node = Node::new(IdHash::hash(b"n"), addr(), 0);
        for i in 0..3u8 {
            let txn = [i, 0, 0, 0];
            node.requested(txn, 0);
            let expired = node.record_timeout(txn);
            if i < 2 {
                assert!(!expired);
            } else {
                assert!(expired);
            }
        }
        assert!(node.is_expired());
    }

    #[test]
    fn reply_resets_timeout_counter_and_expired_flag() {
        let mut node = Node::new(IdHash::hash(b"n"), addr(), 0);
        for i in 0..3u8 {
            let txn = [i, 0, 0, 0];
            node.requested(txn, 0);
            node.record_timeout(txn);
        }
        assert!(node.is_expired());
        node.requested([9, 9, 9, 9], 10);
        node.record_reply([9, 9, 9, 9], 11);
        assert!(!node.is_expired());
    }

    #[test]
    fn expirable_requires_pending_and_staleness() {
        let mut node = Node::new(IdHash::hash(b"n"), addr(), 0);
        node.record_reply([1, 1, 1, 1], 0);
        assert!(!node.is_expirable(NODE_EXPIRE_TIME_SECS + 1));
        node.requested([2, 2, 2, 2], NODE_EXPIRE_TIME_SECS + 1);
        assert!(node.is_expirable(NODE_EXPIRE_TIME_SECS + 1));
    }
}
