//! Kademlia k-bucket routing table.
//!
//! Buckets are modeled as actual contiguous prefix ranges that can
//! split, rather than a flat fixed-size array bucketed by a precomputed
//! distance: only the bucket covering the owner id ever needs to split,
//! which a flat array can't express without keeping 160 buckets
//! permanently allocated. The split-on-demand tree below follows the
//! same design Subotai's and OpenDHT's routing tables use.

use crate::id::{Distance, IdHash, ID_BITS};
use crate::node::Node;
use std::time::SystemTime;
use tracing::debug;

/// Replication / shortlist constant.
pub const K: usize = 8;

/// Minimum time between unprompted refreshes of an untouched bucket.
pub const BUCKET_REFRESH_INTERVAL_SECS: u64 = 15 * 60;

/// One bucket: a contiguous range of the id space, expressed as the
/// common-prefix length shared with the owner id. `prefix_len == n`
/// means this bucket covers every id whose first `n` bits match the
/// owner id and whose `(n+1)`th bit differs (except the final bucket,
/// which has no such differing bit and covers only ids identical in
/// their first `prefix_len` bits all the way down — in practice just the
/// owner id's own 1-node bucket at full depth).
#[derive(Debug, Clone)]
struct Bucket {
    prefix_len: usize,
    nodes: Vec<Node>,
    last_refreshed: u64,
}

impl Bucket {
    fn new(prefix_len: usize) -> Self {
        Bucket {
            prefix_len,
            nodes: Vec::new(),
            last_refreshed: 0,
        }
    }

    fn is_full(&self, now: u64) -> bool {
        self.nodes.iter().filter(|n| n.is_good(now)).count() >= K
    }

    fn find(&self, id: &IdHash) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == *id)
    }
}

/// Ordered list of buckets partitioning `[0, 2^160)`, covering the space
/// without gaps or overlap. Only the last bucket in the list (the one
/// whose prefix range still contains the owner id) is ever split.
pub struct RoutingTable {
    own_id: IdHash,
    /// Buckets ordered by increasing prefix length; the last one always
    /// covers the owner id and is the only one eligible to split.
    buckets: Vec<Bucket>,
    dropped_malformed: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingStats {
    pub total_nodes: usize,
    pub total_buckets: usize,
    pub dropped_malformed: u64,
}

impl RoutingTable {
    pub fn new(own_id: IdHash) -> Self {
        RoutingTable {
            own_id,
            buckets: vec![Bucket::new(0)],
            dropped_malformed: 0,
        }
    }

    pub fn own_id(&self) -> IdHash {
        self.own_id
    }

    fn bucket_index_for(&self, id: &IdHash) -> usize {
        let depth = self.own_id.common_prefix_len(id).min(ID_BITS);
        // Find the last bucket whose prefix_len <= depth: buckets are
        // ordered by increasing prefix_len and every id falls in exactly
        // one, since splitting only ever grows the owner-covering tail.
        let mut idx = 0;
        for (i, b) in self.buckets.iter().enumerate() {
            if b.prefix_len <= depth {
                idx = i;
            } else {
                break;
            }
        }
        idx
    }

    fn covers_owner(&self, index: usize) -> bool {
        index == self.buckets.len() - 1
    }

    /// Insert a node:
    /// - not full: append
    /// - full and covers owner: split at the midpoint and retry
    /// - full and does not cover owner: drop, unless an existing node in
    ///   the bucket is expired, in which case replace it
    pub fn insert(&mut self, node: Node, now: u64) -> InsertOutcome {
        if node.id.is_zero() || node.id == self.own_id {
            self.dropped_malformed += 1;
            return InsertOutcome::Rejected;
        }

        loop {
            let idx = self.bucket_index_for(&node.id);

            if let Some(pos) = self.buckets[idx].find(&node.id) {
                // Already known: refresh in place, preferring the more
                // recent of last_reply.
                let existing = &mut self.buckets[idx].nodes[pos];
                if node.last_reply >= existing.last_reply {
                    *existing = node;
                }
                return InsertOutcome::Updated;
            }

            if !self.buckets[idx].is_full(now) {
                self.buckets[idx].nodes.push(node);
                return InsertOutcome::Inserted;
            }

            if self.covers_owner(idx) && self.buckets[idx].prefix_len < ID_BITS {
                self.split_bucket(idx);
                continue; // retry insertion against the freshly split buckets
            }

            // Full, doesn't cover owner (or already at max depth):
            // replace an expired node if one exists, else drop.
            if let Some(expired_pos) = self.buckets[idx]
                .nodes
                .iter()
                .position(|n| n.is_expired())
            {
                self.buckets[idx].nodes[expired_pos] = node;
                return InsertOutcome::Replaced;
            }

            debug!(id = %node.id, "k-bucket full, dropping new node");
            return InsertOutcome::Rejected;
        }
    }

    /// Split the bucket at `index` (which must be the owner-covering
    /// tail bucket) into two buckets at `prefix_len + 1`: one still
    /// covering the owner id, one covering the sibling range. Nodes are
    /// redistributed by their bit at the new prefix position.
    fn split_bucket(&mut self, index: usize) {
        let old = self.buckets.remove(index);
        let new_prefix = old.prefix_len + 1;
        let mut owner_side = Bucket::new(new_prefix);
        let mut sibling_side = Bucket::new(new_prefix);

        for n in old.nodes {
            if self.own_id.common_prefix_len(&n.id) >= new_prefix {
                owner_side.nodes.push(n);
            } else {
                sibling_side.nodes.push(n);
            }
        }

        // The sibling bucket (not covering the owner) goes first in
        // prefix order conceptually, but since both share the same
        // prefix_len and only the *last* bucket in the vec is treated as
        // owner-covering, we must insert the owner-covering one last.
        self.buckets.insert(index, sibling_side);
        self.buckets.insert(index + 1, owner_side);
    }

    /// Return up to `n` nodes sorted by XOR distance to `target`,
    /// traversing outward from the bucket containing `target`.
    pub fn find_closest(&self, target: &IdHash, n: usize) -> Vec<Node> {
        let mut all: Vec<&Node> = self.buckets.iter().flat_map(|b| b.nodes.iter()).collect();
        all.sort_by(|a, b| {
            a.id.distance(target)
                .cmp(&b.id.distance(target))
                .then_with(|| b.last_reply.cmp(&a.last_reply)) // tie-break: last_reply desc
        });
        all.into_iter().take(n).cloned().collect()
    }

    pub fn remove(&mut self, id: &IdHash) {
        let idx = self.bucket_index_for(id);
        self.buckets[idx].nodes.retain(|n| n.id != *id);
    }

    pub fn mark_replied(&mut self, id: &IdHash, transaction_id: [u8; 4], now: u64) {
        let idx = self.bucket_index_for(id);
        if let Some(pos) = self.buckets[idx].find(id) {
            self.buckets[idx].nodes[pos].record_reply(transaction_id, now);
        }
    }

    pub fn mark_timeout(&mut self, id: &IdHash, transaction_id: [u8; 4]) {
        let idx = self.bucket_index_for(id);
        if let Some(pos) = self.buckets[idx].find(id) {
            self.buckets[idx].nodes[pos].record_timeout(transaction_id);
        }
    }

    /// Buckets due for a refresh: haven't been queried within
    /// `BUCKET_REFRESH_INTERVAL_SECS`. Returns a random id inside each
    /// due bucket's range, suitable as a `find_node` target.
    pub fn buckets_due_for_refresh(&self, now: u64) -> Vec<IdHash> {
        self.buckets
            .iter()
            .filter(|b| now.saturating_sub(b.last_refreshed) >= BUCKET_REFRESH_INTERVAL_SECS)
            .map(|b| self.random_id_in_bucket(b))
            .collect()
    }

    pub fn mark_refreshed(&mut self, prefix_len: usize, now: u64) {
        if let Some(b) = self.buckets.iter_mut().find(|b| b.prefix_len == prefix_len) {
            b.last_refreshed = now;
        }
    }

    fn random_id_in_bucket(&self, bucket: &Bucket) -> IdHash {
        let mut candidate = IdHash::random();
        // Force the shared prefix to match the owner id, then flip the
        // first differing bit so the id falls in this specific bucket's
        // range rather than deeper toward the owner.
        for bit in 0..bucket.prefix_len {
            set_bit(&mut candidate.0, bit, get_bit(&self.own_id.0, bit));
        }
        if bucket.prefix_len < ID_BITS {
            set_bit(&mut candidate.0, bucket.prefix_len, !get_bit(&self.own_id.0, bucket.prefix_len));
        }
        candidate
    }

    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            total_nodes: self.buckets.iter().map(|b| b.nodes.len()).sum(),
            total_buckets: self.buckets.len(),
            dropped_malformed: self.dropped_malformed,
        }
    }

    /// Every node reference across all buckets, for janitor sweeps etc.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    fn assert_partition_is_contiguous(&self) {
        // Every bucket but the last has strictly increasing prefix_len;
        // the invariant we actually care about (coverage without gaps)
        // follows from bucket_index_for always resolving to exactly one
        // bucket for any id, checked indirectly by the tests below.
        for w in self.buckets.windows(2) {
            assert!(w[0].prefix_len < w[1].prefix_len);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
    Replaced,
    Rejected,
}

fn get_bit(bytes: &[u8; 20], bit: usize) -> bool {
    let byte = bytes[bit / 8];
    (byte >> (7 - (bit % 8))) & 1 == 1
}

fn set_bit(bytes: &mut [u8; 20], bit: usize, value: bool) {
    let mask = 1u8 << (7 - (bit % 8));
    if value {
        bytes[bit / 8] |= mask;
    } else {
        bytes[bit / 8] &= !mask;
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn good_node(id: IdHash, port: u16, now: u64) -> Node {
        let mut n = Node::new(id, addr(port), now);
        n.record_reply([0, 0, 0, 1], now);
        n
    }

    #[test]
    fn distinct_nodes_share_bucket_implies_shared_prefix() {
        let own = IdHash::hash(b"owner");
        let mut table = RoutingTable::new(own);
        let now = 1_000;
        for i in 0..40u32 {
            let id = IdHash::hash(&i.to_be_bytes());
            table.insert(good_node(id, 5000 + i as u16, now), now);
        }
        for b in &table.buckets {
            for pair in b.nodes.windows(2) {
                assert_ne!(pair[0].id, pair[1].id);
            }
        }
        table.assert_partition_is_contiguous();
    }

    #[test]
    fn full_bucket_covering_owner_splits_and_retains_closer_node() {
        let own = IdHash([0u8; 20]);
        let mut table = RoutingTable::new(own);
        let now = 1_000;
        // Fill bucket 0 (prefix_len 0, covers everyone) with K good nodes
        // that all share bit 0 = 1 (far from owner) so the bucket stays
        // full without forcing a split yet.
        for i in 0..K as u8 {
            let mut id_bytes = [0u8; 20];
            id_bytes[0] = 0b1000_0000;
            id_bytes[19] = i;
            table.insert(good_node(IdHash(id_bytes), 5000 + i as u16, now), now);
        }
        assert_eq!(table.bucket_count(), 1);

        // Now insert a node close to the owner (bit 0 = 0): this forces
        // the owner-covering bucket to split and the node should be
        // retained afterward.
        let mut close_id = [0u8; 20];
        close_id[19] = 0xAA;
        let before = table.stats().total_nodes;
        let outcome = table.insert(good_node(IdHash(close_id), 6000, now), now);
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert!(table.bucket_count() > 1);
        assert_eq!(table.stats().total_nodes, before + 1);
        assert!(table.find_closest(&IdHash(close_id), 1)[0].id == IdHash(close_id));
    }

    #[test]
    fn full_bucket_not_covering_owner_rejects_new_good_node() {
        let own = IdHash([0u8; 20]);
        let mut table = RoutingTable::new(own);
        let now = 1_000;

        // Force a split so bucket 0 no longer covers the owner (push a
        // near node in first, then fill the resulting far bucket).
        let mut near = [0u8; 20];
        near[19] = 1;
        table.insert(good_node(IdHash(near), 4000, now), now);

        for i in 0..K as u8 {
            let mut id_bytes = [0u8; 20];
            id_bytes[0] = 0b1000_0000;
            id_bytes[19] = i;
            table.insert(good_node(IdHash(id_bytes), 5000 + i as u16, now), now);
        }
        // One more far, non-owner-covering bucket node while it's full
        // of good nodes: rejected.
        let mut extra = [0u8; 20];
        extra[0] = 0b1000_0000;
        extra[19] = 0xFE;
        let outcome = table.insert(good_node(IdHash(extra), 9000, now), now);
        assert_eq!(outcome, InsertOutcome::Rejected);
    }

    #[test]
    fn find_closest_returns_true_k_closest() {
        let own = IdHash::hash(b"owner");
        let mut table = RoutingTable::new(own);
        let now = 1_000;
        let mut ids = Vec::new();
        for i in 0..50u32 {
            let id = IdHash::hash(&i.to_be_bytes());
            ids.push(id);
            table.insert(good_node(id, 5000 + i as u16, now), now);
        }
        let target = IdHash::hash(b"target");
        let closest = table.find_closest(&target, K);
        let mut all_sorted = ids.clone();
        all_sorted.sort_by_key(|id| id.distance(&target).0);
        let true_kth = all_sorted[K - 1];
        let returned_kth = closest[K - 1].id;
        assert!(returned_kth.distance(&target) <= true_kth.distance(&target));
    }

    #[test]
    fn expired_node_is_replaced_in_full_non_owner_bucket() {
        let own = IdHash([0u8; 20]);
        let mut table = RoutingTable::new(own);
        let now = 1_000;

        let mut near = [0u8; 20];
        near[19] = 1;
        table.insert(good_node(IdHash(near), 4000, now), now);

        let mut first_far_id = None;
        for i in 0..K as u8 {
            let mut id_bytes = [0u8; 20];
            id_bytes[0] = 0b1000_0000;
            id_bytes[19] = i;
            if i == 0 {
                first_far_id = Some(IdHash(id_bytes));
            }
            table.insert(good_node(IdHash(id_bytes), 5000 + i as u16, now), now);
        }
        table.mark_timeout(&first_far_id.unwrap(), [1, 1, 1, 1]);
        // Force expiry directly via repeated timeouts through the public API.
        for _ in 0..3 {
            let idx = table.bucket_index_for(&first_far_id.unwrap());
            if let Some(pos) = table.buckets[idx].find(&first_far_id.unwrap()) {
                table.buckets[idx].nodes[pos].requested([2, 2, 2, 2], now);
                table.buckets[idx].nodes[pos].record_timeout([2, 2, 2, 2]);
            }
        }

        let mut extra = [0u8; 20];
        extra[0] = 0b1000_0000;
        extra[19] = 0xFE;
        let outcome = table.insert(good_node(IdHash(extra), 9000, now), now);
        assert_eq!(outcome, InsertOutcome::Replaced);
    }
}
