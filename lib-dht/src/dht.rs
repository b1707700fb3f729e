//! The raw, unsigned Kademlia node: composes the routing
//! table, network transport, local storage, and the iterative-lookup
//! state machine into `get`/`put`/`listen`/`ping`/`periodic`. Signing,
//! encryption, and certificate resolution are layered on top by
//! [`crate::secure::SecureDht`] — this type only knows about opaque
//! [`Value`] records and byte payloads on the wire.

use crate::clock::{Clock, Timestamp};
use crate::error::DhtError;
use crate::id::IdHash;
use crate::network::Network;
use crate::node::Node;
use crate::routing::RoutingTable;
use crate::search::{SearchKind, SearchPhase, SearchState, ALPHA};
use crate::stats::Stats;
use crate::storage::{PutOutcome, Storage};
use crate::value::Value;
use crate::wire::{CompactNode, Message, Query, Reply};
use lib_crypto::hash_blake3;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a write token remains valid before it rolls into the grace
/// period (BitTorrent-DHT-style token rotation, used here to authorize
/// `put`/`announce` without requiring a signed identity).
const TOKEN_ROTATE_SECS: u64 = 5 * 60;

/// Overall wall-clock budget for one iterative lookup before it is
/// abandoned as failed.
const SEARCH_BUDGET: Duration = Duration::from_secs(8);

pub struct Dht {
    own_id: IdHash,
    routing: RoutingTable,
    network: Network,
    storage: Storage,
    clock: Arc<dyn Clock>,
    stats: Arc<Stats>,
    storage_byte_budget: usize,

    searches: HashMap<u64, SearchState>,
    txn_to_search: HashMap<[u8; 4], u64>,
    next_search_id: u64,

    token_secret: [u8; 32],
    prev_token_secret: [u8; 32],
    last_token_rotation: Timestamp,

    listeners: HashMap<u64, ListenRegistration>,
    next_listener_id: u64,
}

struct ListenRegistration {
    key: IdHash,
    sender: tokio::sync::mpsc::UnboundedSender<ListenEvent>,
    /// Content hash last reported for each value id currently known
    /// under `key`, used to tell a genuinely new/changed value apart
    /// from one already reported, and to detect when an id drops out
    /// (spec.md §8 "Monotone listen: new (expired?)").
    known: HashMap<u64, [u8; 32]>,
}

pub struct ListenHandle(pub u64);

/// One notification delivered to a `listen` subscriber: either a new or
/// updated value, or notice that a previously-seen value id is gone
/// (cancelled or expired). Grounded in `dht_runner_listen`'s callback
/// signature, which carries the same new-vs-expired distinction as a
/// boolean flag alongside the value.
#[derive(Debug, Clone)]
pub enum ListenEvent {
    New(Value),
    Expired(u64),
}

impl Dht {
    pub async fn new(
        own_id: IdHash,
        bind_v4: SocketAddr,
        bind_v6: Option<SocketAddr>,
        storage_byte_budget: usize,
        clock: Arc<dyn Clock>,
        stats: Arc<Stats>,
    ) -> anyhow::Result<Self> {
        let network = Network::bind(bind_v4, bind_v6).await?;
        let now = clock.now();
        Ok(Dht {
            own_id,
            routing: RoutingTable::new(own_id),
            network,
            storage: Storage::new(storage_byte_budget),
            clock,
            stats,
            storage_byte_budget,
            searches: HashMap::new(),
            txn_to_search: HashMap::new(),
            next_search_id: 1,
            token_secret: crate::crypto::random_bytes(),
            prev_token_secret: crate::crypto::random_bytes(),
            last_token_rotation: now,
            listeners: HashMap::new(),
            next_listener_id: 1,
        })
    }

    pub fn own_id(&self) -> IdHash {
        self.own_id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.network.local_addr_v4()
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// The node's current clock reading, exposed for callers (e.g.
    /// [`crate::secure::SecureDht`]) that need a creation timestamp when
    /// building a [`Value`] before calling `put`.
    pub fn local_now(&self) -> Timestamp {
        self.now()
    }

    #[cfg(test)]
    pub fn test_corrupt_first(&mut self, key: &IdHash, data: Vec<u8>) {
        self.storage.test_corrupt_first(key, data);
    }

    /// Receive the next datagram without dispatching it, for the
    /// `Runner`'s main select loop to drive (the lookup loop in
    /// `run_lookup` calls `network.recv` directly for the same reason:
    /// only one place at a time may own the socket read).
    pub async fn recv_message(&mut self) -> anyhow::Result<(SocketAddr, Message)> {
        self.network.recv().await
    }

    pub fn snapshot_nodes(&self) -> Vec<(IdHash, SocketAddr, Timestamp)> {
        self.routing.all_nodes().map(|n| (n.id, n.addr, n.last_reply)).collect()
    }

    pub fn snapshot_values(&self) -> Vec<(IdHash, Vec<u8>)> {
        self.storage.all_entries()
    }

    pub fn restore_nodes(&mut self, nodes: Vec<(IdHash, SocketAddr, Timestamp)>) {
        let now = self.now();
        for (id, addr, last_reply) in nodes {
            let mut n = Node::new(id, addr, now);
            n.record_reply([0, 0, 0, 0], last_reply.min(now));
            self.routing.insert(n, now);
        }
    }

    pub fn restore_values(&mut self, values: Vec<(IdHash, Vec<u8>)>) {
        let now = self.now();
        for (key, bytes) in values {
            if let Ok(value) = bincode::deserialize::<Value>(&bytes) {
                self.storage.put(key, value, None, now);
            }
        }
    }

    // ---- write-token handling ----

    /// Opaque write-grant for `addr`: the low 8 bytes of a BLAKE3 digest
    /// over the rotating secret and the requester's IP (spec.md §6
    /// "Tokens are opaque 8-byte write-grants").
    fn token_for(&self, addr: SocketAddr, secret: &[u8; 32]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(secret.len() + 18);
        buf.extend_from_slice(secret);
        match addr.ip() {
            std::net::IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
            std::net::IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
        }
        hash_blake3(&buf)[..8].to_vec()
    }

    fn current_token(&self, addr: SocketAddr) -> Vec<u8> {
        self.token_for(addr, &self.token_secret)
    }

    fn token_is_valid(&self, addr: SocketAddr, token: &[u8]) -> bool {
        token == self.token_for(addr, &self.token_secret) || token == self.token_for(addr, &self.prev_token_secret)
    }

    fn maybe_rotate_tokens(&mut self, now: Timestamp) {
        if now.saturating_sub(self.last_token_rotation) >= TOKEN_ROTATE_SECS {
            self.prev_token_secret = self.token_secret;
            self.token_secret = crate::crypto::random_bytes();
            self.last_token_rotation = now;
        }
    }

    // ---- bootstrap / ping ----

    pub async fn bootstrap(&mut self, addrs: &[SocketAddr]) -> anyhow::Result<()> {
        for addr in addrs {
            self.ping(*addr).await.ok();
        }
        self.find_node(self.own_id).await.ok();
        Ok(())
    }

    pub async fn ping(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        let now = self.now();
        let sender = self.own_id;
        self.network
            .send_query(addr, None, |txn| Message::Query { transaction_id: txn, sender, query: Query::Ping }, now)
            .await?;
        Ok(())
    }

    // ---- iterative lookups ----

    fn start_search(&mut self, target: IdHash, kind: SearchKind) -> u64 {
        let seed = self.routing.find_closest(&target, crate::routing::K);
        let id = self.next_search_id;
        self.next_search_id += 1;
        self.searches.insert(id, SearchState::new(target, kind, seed));
        id
    }

    async fn pump_search(&mut self, search_id: u64) -> anyhow::Result<()> {
        let now = self.now();
        let targets = match self.searches.get_mut(&search_id) {
            Some(s) => s.next_batch(),
            None => return Ok(()),
        };
        if targets.is_empty() {
            return Ok(());
        }
        let search = self.searches.get(&search_id).unwrap();
        let query_key = search.target;
        let kind = search.kind;

        for node_id in targets {
            let addr = match self.routing.find_closest(&node_id, 1).into_iter().find(|n| n.id == node_id) {
                Some(n) => n.addr,
                None => continue,
            };
            let sender = self.own_id;
            let query = match kind {
                SearchKind::FindNode => Query::FindNode { target: query_key },
                SearchKind::Get | SearchKind::Listen => Query::Get { key: query_key },
                SearchKind::Put { .. } | SearchKind::Announce => Query::FindNode { target: query_key },
            };
            let txn = self
                .network
                .send_query(addr, Some(node_id), move |txn| Message::Query { transaction_id: txn, sender, query }, now)
                .await?;
            self.txn_to_search.insert(txn, search_id);
        }
        Ok(())
    }

    async fn run_lookup(&mut self, search_id: u64) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + SEARCH_BUDGET;
        self.pump_search(search_id).await?;
        loop {
            if self.searches.get(&search_id).map(|s| s.is_terminal() || s.phase == SearchPhase::Converged).unwrap_or(true) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                if let Some(s) = self.searches.get_mut(&search_id) {
                    s.cancel();
                }
                break;
            }
            let step = tokio::time::timeout(Duration::from_millis(250), self.network.recv()).await;
            match step {
                Ok(Ok((from, msg))) => self.dispatch(from, msg).await?,
                Ok(Err(e)) => warn!(error = %e, "network recv error during lookup"),
                Err(_) => {
                    self.check_timeouts();
                    self.pump_search(search_id).await?;
                }
            }
            if let Some(s) = self.searches.get_mut(&search_id) {
                s.advance_if_converged();
            }
        }
        Ok(())
    }

    pub async fn find_node(&mut self, target: IdHash) -> anyhow::Result<Vec<Node>> {
        let id = self.start_search(target, SearchKind::FindNode);
        self.run_lookup(id).await?;
        let result = self.searches.get(&id).map(|s| s.closest_k(crate::routing::K)).unwrap_or_default();
        self.searches.remove(&id);
        Ok(result)
    }

    // ---- get / put / listen ----

    pub async fn get(&mut self, key: IdHash) -> Result<Vec<Value>, DhtError> {
        Stats::incr(&self.stats.gets);
        let decoded = self.get_raw(key).await;
        if decoded.is_empty() {
            Stats::incr(&self.stats.search_failures);
            return Err(DhtError::SearchFailed { target: key });
        }
        Ok(decoded)
    }

    /// Like `get`, but returns an empty list instead of an error when
    /// nothing is found — used by `poll_listeners`, which needs to tell
    /// "no values" apart from "search could not be run" to detect a
    /// value id disappearing (cancelled or expired).
    async fn get_raw(&mut self, key: IdHash) -> Vec<Value> {
        let local: Vec<Value> = self.storage.get(&key).into_iter().cloned().collect();
        if !local.is_empty() {
            return local;
        }

        let id = self.start_search(key, SearchKind::Get);
        if self.run_lookup(id).await.is_err() {
            self.searches.remove(&id);
            return Vec::new();
        }
        let values = self.searches.get(&id).map(|s| s.values.clone()).unwrap_or_default();
        self.searches.remove(&id);

        values.iter().filter_map(|bytes| bincode::deserialize::<Value>(bytes).ok()).collect()
    }

    pub async fn put(&mut self, key: IdHash, mut value: Value, ttl: Option<Duration>) -> Result<u64, DhtError> {
        Stats::incr(&self.stats.puts);
        let now = self.now();
        let resolved_id = value.resolve_id();
        let serialized = bincode::serialize(&value).map_err(|e| DhtError::ValueRejected { reason: e.to_string() })?;

        // Discover the current closest nodes and collect write tokens
        // from them via a Get-shaped lookup.
        let id = self.start_search(key, SearchKind::Get);
        self.run_lookup(id).await.map_err(|_| DhtError::SearchFailed { target: key })?;
        let (targets, tokens) = match self.searches.remove(&id) {
            Some(s) => (s.closest_k(crate::routing::K), s.tokens),
            None => (Vec::new(), HashMap::new()),
        };

        if self.is_among_closest(&key, &targets) {
            let (outcome, _) = self.storage.put(key, value.clone(), ttl, now);
            if outcome == PutOutcome::Overflow {
                Stats::incr(&self.stats.local_overflows);
            }
        }

        if targets.is_empty() {
            // No peers known at all: accept locally only (single-node
            // bootstrap case), otherwise this is a real failure.
            if self.storage.get(&key).is_empty() {
                return Err(DhtError::SearchFailed { target: key });
            }
            return Ok(resolved_id);
        }

        let mut acked = 0usize;
        for node in &targets {
            let token = tokens.get(&node.id).cloned();
            let sender = self.own_id;
            let query = Query::Put { key, value: serialized.clone(), permanent: ttl.is_none(), token };
            if self
                .network
                .send_query(node.addr, Some(node.id), move |txn| Message::Query { transaction_id: txn, sender, query }, now)
                .await
                .is_ok()
            {
                acked += 1;
            }
        }

        if acked == 0 {
            Stats::incr(&self.stats.value_rejections);
            return Err(DhtError::ValueRejected { reason: "no peer accepted the put".into() });
        }
        Ok(resolved_id)
    }

    /// Cancel a pending or already-stored put (spec.md §4.I
    /// `cancelPut(key, value_id)`). Removes the value from this node's
    /// own storage so it stops being served and re-announced; remote
    /// copies already placed on other nodes are not reached directly —
    /// they fall out of their own TTL once this node stops refreshing
    /// them, matching spec.md §8 scenario 5 ("within TTL, C receives an
    /// expired callback"). Grounded on `dht_runner_cancel_put`'s
    /// `(infohash, value_id)` signature.
    pub fn cancel_put(&mut self, key: IdHash, value_id: u64) {
        self.storage.remove(&key, value_id);
    }

    fn is_among_closest(&self, key: &IdHash, targets: &[Node]) -> bool {
        if targets.len() < crate::routing::K {
            return true;
        }
        let farthest = targets.iter().map(|n| n.id.distance(key)).max();
        match farthest {
            Some(d) => self.own_id.distance(key) <= d,
            None => true,
        }
    }

    pub fn listen(&mut self, key: IdHash) -> (ListenHandle, tokio::sync::mpsc::UnboundedReceiver<ListenEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.insert(id, ListenRegistration { key, sender: tx, known: HashMap::new() });
        (ListenHandle(id), rx)
    }

    pub fn cancel_listen(&mut self, handle: ListenHandle) {
        self.listeners.remove(&handle.0);
    }

    /// Poll every active listener for new values under its key, and
    /// report any previously-seen value id that has since disappeared
    /// (cancelled or expired) as `ListenEvent::Expired`. Listen is
    /// implemented as periodic re-polling rather than a server-push
    /// message, since the wire protocol has no dedicated push frame
    /// (see `DESIGN.md` for the reasoning).
    async fn poll_listeners(&mut self) {
        let keys: Vec<(u64, IdHash)> = self.listeners.iter().map(|(id, r)| (*id, r.key)).collect();
        for (id, key) in keys {
            let values = self.get_raw(key).await;
            let mut current: HashMap<u64, [u8; 32]> = HashMap::new();
            for v in &values {
                let bytes = bincode::serialize(v).unwrap_or_default();
                current.insert(v.id, hash_blake3(&bytes));
            }

            if let Some(reg) = self.listeners.get_mut(&id) {
                for v in &values {
                    if reg.known.get(&v.id) != current.get(&v.id) {
                        let _ = reg.sender.send(ListenEvent::New(v.clone()));
                    }
                }
                let expired: Vec<u64> = reg.known.keys().filter(|id| !current.contains_key(id)).copied().collect();
                for value_id in expired {
                    let _ = reg.sender.send(ListenEvent::Expired(value_id));
                }
                reg.known = current;
            }
        }
    }

    // ---- message dispatch ----

    fn check_timeouts(&mut self) {
        let now = self.now();
        self.stats.malformed_packets.store(self.network.dropped_malformed, std::sync::atomic::Ordering::Relaxed);
        let timed_out = self.network.drain_timeouts(now);
        for (txn, _addr, to_id) in timed_out {
            Stats::incr(&self.stats.timeouts);
            if let Some(id) = to_id {
                self.routing.mark_timeout(&id, txn);
            }
            if let Some(search_id) = self.txn_to_search.remove(&txn) {
                if let Some(s) = self.searches.get_mut(&search_id) {
                    s.record_timeout(to_id.unwrap_or(IdHash::ZERO));
                }
            }
        }
    }

    pub async fn dispatch(&mut self, from: SocketAddr, msg: Message) -> anyhow::Result<()> {
        let now = self.now();
        self.maybe_rotate_tokens(now);
        match msg {
            Message::Query { transaction_id, sender, query } => {
                self.routing.insert(Node::new(sender, from, now), now);
                self.handle_query(from, transaction_id, sender, query).await?;
            }
            Message::Reply { transaction_id, sender, reply } => {
                let completed = self.network.complete(transaction_id);
                if let Some((_, Some(id))) = completed {
                    self.routing.mark_replied(&id, transaction_id, now);
                }
                self.routing.insert(Node::new(sender, from, now), now);
                if let Some(search_id) = self.txn_to_search.remove(&transaction_id) {
                    let discovered: Vec<Node> = reply
                        .nodes
                        .iter()
                        .chain(reply.nodes6.iter())
                        .filter(|n| n.id != self.own_id)
                        .map(|n: &CompactNode| Node::new(n.id, n.addr, now))
                        .collect();
                    if let Some(s) = self.searches.get_mut(&search_id) {
                        for v in &reply.values {
                            s.record_reply(sender, vec![], Some(v.clone()), reply.token.clone());
                        }
                        if reply.values.is_empty() {
                            s.record_reply(sender, discovered, None, reply.token.clone());
                        } else {
                            for n in discovered {
                                s.offer(n);
                            }
                        }
                    }
                }
            }
            Message::Error { transaction_id, code, message } => {
                debug!(code, %message, "peer returned error");
                self.network.complete(transaction_id);
                self.txn_to_search.remove(&transaction_id);
            }
        }
        Ok(())
    }

    async fn handle_query(&mut self, from: SocketAddr, txn: [u8; 4], sender: IdHash, query: Query) -> anyhow::Result<()> {
        let now = self.now();
        let own_id = self.own_id;
        match query {
            Query::Ping => {
                self.network
                    .send_reply(from, &Message::Reply { transaction_id: txn, sender: own_id, reply: Reply::default() })
                    .await?;
            }
            Query::FindNode { target } => {
                let nodes = self.routing.find_closest(&target, crate::routing::K);
                let reply = Reply {
                    id: Some(own_id),
                    nodes: to_compact(&nodes),
                    ..Default::default()
                };
                self.network.send_reply(from, &Message::Reply { transaction_id: txn, sender: own_id, reply }).await?;
            }
            Query::Get { key } => {
                let values: Vec<Vec<u8>> = self
                    .storage
                    .get(&key)
                    .into_iter()
                    .filter_map(|v| bincode::serialize(v).ok())
                    .collect();
                let nodes = self.routing.find_closest(&key, crate::routing::K);
                let reply = Reply {
                    id: Some(own_id),
                    nodes: to_compact(&nodes),
                    values,
                    token: Some(self.current_token(from)),
                    ..Default::default()
                };
                self.network.send_reply(from, &Message::Reply { transaction_id: txn, sender: own_id, reply }).await?;
            }
            Query::Put { key, value, permanent, token } => {
                let authorized = token.as_deref().map(|t| self.token_is_valid(from, t)).unwrap_or(false);
                if !authorized {
                    Stats::incr(&self.stats.permission_denied);
                    self.network
                        .send_reply(from, &Message::Error { transaction_id: txn, code: 203, message: "bad token".into() })
                        .await?;
                    return Ok(());
                }
                let parsed: Result<Value, _> = bincode::deserialize(&value);
                match parsed {
                    Ok(v) if v.verify_signature(&crate::crypto::DefaultCryptoProvider) => {
                        let ttl = if permanent { None } else { Some(Duration::from_secs(crate::storage::VALUE_DEFAULT_TTL_SECS)) };
                        let (outcome, _) = self.storage.put(key, v, ttl, now);
                        if outcome == PutOutcome::Overflow {
                            Stats::incr(&self.stats.local_overflows);
                            self.network
                                .send_reply(from, &Message::Error { transaction_id: txn, code: 201, message: "storage overflow".into() })
                                .await?;
                        } else {
                            self.network
                                .send_reply(from, &Message::Reply { transaction_id: txn, sender: own_id, reply: Reply::default() })
                                .await?;
                        }
                    }
                    _ => {
                        Stats::incr(&self.stats.value_rejections);
                        self.network
                            .send_reply(from, &Message::Error { transaction_id: txn, code: 202, message: "signature verification failed".into() })
                            .await?;
                    }
                }
            }
            Query::Listen { key, token } => {
                // Treated identically to `get` at the wire level; the
                // caller re-polls (see `poll_listeners`).
                self.handle_query(from, txn, sender, Query::Get { key }).await?;
                let _ = token;
            }
            Query::Announce { key, token } | Query::Refresh { key, token } => {
                let authorized = self.token_is_valid(from, &token);
                if !authorized {
                    Stats::incr(&self.stats.permission_denied);
                    self.network
                        .send_reply(from, &Message::Error { transaction_id: txn, code: 203, message: "bad token".into() })
                        .await?;
                    return Ok(());
                }
                let _ = key;
                self.network
                    .send_reply(from, &Message::Reply { transaction_id: txn, sender: own_id, reply: Reply::default() })
                    .await?;
            }
        }
        Ok(())
    }

    /// One periodic maintenance tick: bucket refresh,
    /// storage janitor pass, permanent re-announce, token rotation,
    /// listener polling, and timeout sweep.
    pub async fn periodic(&mut self) -> anyhow::Result<()> {
        let now = self.now();
        self.maybe_rotate_tokens(now);
        self.check_timeouts();
        self.storage.expire(now);

        for target in self.routing.buckets_due_for_refresh(now) {
            self.find_node(target).await.ok();
        }

        let permanent_keys = self.storage.permanent_keys();
        for key in permanent_keys {
            if let Some(value) = self.storage.get(&key).first().cloned().cloned() {
                self.put(key, value, None).await.ok();
            }
        }

        self.poll_listeners().await;
        Ok(())
    }

    pub fn stats(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn routing_stats(&self) -> crate::routing::RoutingStats {
        self.routing.stats()
    }

    pub fn storage_stats(&self) -> crate::storage::StorageStats {
        self.storage.stats()
    }

    pub fn storage_byte_budget(&self) -> usize {
        self.storage_byte_budget
    }
}

fn to_compact(nodes: &[Node]) -> Vec<CompactNode> {
    nodes
        .iter()
        .filter(|n| matches!(n.addr, SocketAddr::V4(_)))
        .map(|n| CompactNode { id: n.id, addr: n.addr })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    async fn node() -> Dht {
        let id = IdHash::random();
        Dht::new(id, "127.0.0.1:0".parse().unwrap(), None, 1_000_000, Arc::new(SystemClock), Arc::new(Stats::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ping_establishes_mutual_routing_entries() {
        let mut a = node().await;
        let mut b = node().await;
        let b_addr = b.local_addr().unwrap();

        a.ping(b_addr).await.unwrap();
        let (from, msg) = b.network.recv().await.unwrap();
        b.dispatch(from, msg).await.unwrap();

        let (from2, msg2) = a.network.recv().await.unwrap();
        a.dispatch(from2, msg2).await.unwrap();

        assert_eq!(b.routing.stats().total_nodes, 1);
    }

    #[tokio::test]
    async fn single_node_put_and_get_roundtrip_locally() {
        let mut a = node().await;
        let key = IdHash::hash(b"key");
        let value = Value::new(1, b"hello".to_vec(), "text", 0);
        // With no known peers, put() falls back to local-only storage.
        a.storage.put(key, value.clone(), Some(Duration::from_secs(60)), 0);
        let got = a.get(key).await.unwrap();
        assert_eq!(got[0].data, value.data);
    }

    #[tokio::test]
    async fn token_round_trip_authorizes_put() {
        let a = node().await;
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let token = a.current_token(addr);
        assert!(a.token_is_valid(addr, &token));
        assert!(!a.token_is_valid(addr, b"wrong-token"));
    }

    #[tokio::test]
    async fn token_is_eight_bytes() {
        let a = node().await;
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(a.current_token(addr).len(), 8);
    }

    #[tokio::test]
    async fn put_auto_assigns_a_nonzero_id() {
        let mut a = node().await;
        let key = IdHash::hash(b"key");
        let value = Value::new(1, b"hello".to_vec(), "text", 0);
        let id = a.put(key, value, Some(Duration::from_secs(60))).await.unwrap();
        assert_ne!(id, 0);
    }

    #[tokio::test]
    async fn cancel_put_removes_the_value_from_local_storage() {
        let mut a = node().await;
        let key = IdHash::hash(b"key");
        let (_, id) = a.storage.put(key, Value::new(1, b"hello".to_vec(), "text", 0), Some(Duration::from_secs(60)), 0);
        assert!(!a.storage.get(&key).is_empty());
        a.cancel_put(key, id);
        assert!(a.storage.get(&key).is_empty());
    }

    #[tokio::test]
    async fn listen_reports_new_then_expired_on_cancel_put() {
        let mut a = node().await;
        let key = IdHash::hash(b"key");
        let (_handle, mut rx) = a.listen(key);

        let id = a.put(key, Value::new(1, b"hello".to_vec(), "text", 0), Some(Duration::from_secs(60))).await.unwrap();
        a.poll_listeners().await;
        match rx.try_recv() {
            Ok(ListenEvent::New(v)) => assert_eq!(v.id, id),
            other => panic!("expected a New event, got {other:?}"),
        }

        a.cancel_put(key, id);
        a.poll_listeners().await;
        match rx.try_recv() {
            Ok(ListenEvent::Expired(expired_id)) => assert_eq!(expired_id, id),
            other => panic!("expected an Expired event, got {other:?}"),
        }
    }
}
