//! Iterative lookup state machine (spec.md §4.F), generalized from the
//! teacher's `lib-storage::dht::network` request-dispatch loop to track
//! per-search shortlists instead of one-shot requests.

use crate::id::IdHash;
use crate::node::Node;
use crate::routing::K;
use std::collections::HashSet;

/// Parallelism factor: number of outstanding requests a search keeps in
/// flight at once (spec.md GLOSSARY).
pub const ALPHA: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    FindNode,
    Get,
    /// `Listen` never reaches `Done` on its own; it stays in `Converged`
    /// accepting further value announcements until explicitly cancelled
    /// (spec.md §4.F "Listening side-state").
    Listen,
    Put { permanent: bool },
    Announce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    New,
    Probing,
    Converged,
    Done,
    Cancelled,
}

#[derive(Debug, Clone)]
struct Candidate {
    node: Node,
    queried: bool,
    replied: bool,
}

/// One in-flight iterative lookup toward `target`.
pub struct SearchState {
    pub target: IdHash,
    pub kind: SearchKind,
    pub phase: SearchPhase,
    candidates: Vec<Candidate>,
    queried_ids: HashSet<IdHash>,
    pub values: Vec<Vec<u8>>,
    pub tokens: std::collections::HashMap<IdHash, Vec<u8>>,
    rounds_without_progress: u32,
}

/// Convergence after this many rounds with no new closer candidate ends
/// the probing phase (spec.md §4.F).
const MAX_STALE_ROUNDS: u32 = 2;

impl SearchState {
    pub fn new(target: IdHash, kind: SearchKind, seed: Vec<Node>) -> Self {
        let mut state = SearchState {
            target,
            kind,
            phase: SearchPhase::New,
            candidates: Vec::new(),
            queried_ids: HashSet::new(),
            values: Vec::new(),
            tokens: std::collections::HashMap::new(),
            rounds_without_progress: 0,
        };
        for node in seed {
            state.offer(node);
        }
        state
    }

    /// Offer a candidate node discovered via a reply's node list. Ignored
    /// if already known or already queried.
    pub fn offer(&mut self, node: Node) {
        if self.queried_ids.contains(&node.id) {
            return;
        }
        if self.candidates.iter().any(|c| c.node.id == node.id) {
            return;
        }
        self.candidates.push(Candidate { node, queried: false, replied: false });
        self.sort_candidates();
    }

    /// Sort by distance to `target` and cap the shortlist at `K`
    /// (spec.md §3 "shortlist capped at K by distance"), so a
    /// long-running `Listen` search doesn't grow its candidate set
    /// without bound while it sits in `Converged`.
    fn sort_candidates(&mut self) {
        let target = self.target;
        self.candidates.sort_by_key(|c| c.node.id.distance(&target).0);
        self.candidates.truncate(K);
    }

    /// Select up to `ALPHA` un-queried candidates to send requests to
    /// this round.
    pub fn next_batch(&mut self) -> Vec<IdHash> {
        if self.phase == SearchPhase::New {
            self.phase = SearchPhase::Probing;
        }
        let mut batch = Vec::new();
        for c in self.candidates.iter_mut() {
            if batch.len() >= ALPHA {
                break;
            }
            if !c.queried {
                c.queried = true;
                self.queried_ids.insert(c.node.id);
                batch.push(c.node.id);
            }
        }
        batch
    }

    /// Record a reply from `from`, offering any newly discovered nodes
    /// and appending any returned value/token.
    pub fn record_reply(&mut self, from: IdHash, discovered: Vec<Node>, value: Option<Vec<u8>>, token: Option<Vec<u8>>) {
        let closer_before = self.closest_distance();
        if let Some(c) = self.candidates.iter_mut().find(|c| c.node.id == from) {
            c.replied = true;
        }
        for node in discovered {
            self.offer(node);
        }
        if let Some(v) = value {
            self.values.push(v);
        }
        if let Some(t) = token {
            self.tokens.insert(from, t);
        }

        let closer_after = self.closest_distance();
        if closer_after < closer_before {
            self.rounds_without_progress = 0;
        } else {
            self.rounds_without_progress += 1;
        }
    }

    pub fn record_timeout(&mut self, from: IdHash) {
        self.rounds_without_progress += 1;
        let _ = from;
    }

    fn closest_distance(&self) -> crate::id::Distance {
        self.candidates
            .first()
            .map(|c| c.node.id.distance(&self.target))
            .unwrap_or(crate::id::Distance::MAX)
    }

    /// Whether the search has converged: no un-queried candidates remain
    /// closer than the closest node that has already replied, and
    /// progress has stalled for `MAX_STALE_ROUNDS` rounds.
    pub fn has_converged(&self) -> bool {
        let all_queried = self.candidates.iter().all(|c| c.queried);
        all_queried || self.rounds_without_progress >= MAX_STALE_ROUNDS
    }

    /// Advance the phase once convergence is detected. `Listen` searches
    /// stay in `Converged` forever (until explicitly cancelled);
    /// everything else moves to `Done`.
    pub fn advance_if_converged(&mut self) {
        if self.phase == SearchPhase::Probing && self.has_converged() {
            self.phase = match self.kind {
                SearchKind::Listen => SearchPhase::Converged,
                _ => SearchPhase::Done,
            };
        }
    }

    pub fn cancel(&mut self) {
        self.phase = SearchPhase::Cancelled;
    }

    pub fn closest_k(&self, k: usize) -> Vec<Node> {
        self.candidates.iter().take(k).map(|c| c.node.clone()).collect()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, SearchPhase::Done | SearchPhase::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn node(id: IdHash, port: u16) -> Node {
        Node::new(id, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), 0)
    }

    #[test]
    fn next_batch_respects_alpha() {
        let target = IdHash::hash(b"target");
        let seed: Vec<Node> = (0..10u32).map(|i| node(IdHash::hash(&i.to_be_bytes()), 5000 + i as u16)).collect();
        let mut search = SearchState::new(target, SearchKind::FindNode, seed);
        let batch = search.next_batch();
        assert_eq!(batch.len(), ALPHA);
    }

    #[test]
    fn offering_a_closer_node_resets_stale_round_counter() {
        let target = IdHash::hash(b"target");
        let mut search = SearchState::new(target, SearchKind::FindNode, vec![]);
        search.record_timeout(IdHash::hash(b"nobody"));
        search.record_timeout(IdHash::hash(b"nobody2"));
        assert!(search.has_converged());
    }

    #[test]
    fn find_node_converges_to_done_and_listen_stays_open() {
        let target = IdHash::hash(b"target");
        let n1 = node(IdHash::hash(b"n1"), 5001);
        let mut find = SearchState::new(target, SearchKind::FindNode, vec![n1.clone()]);
        find.next_batch();
        find.advance_if_converged();
        assert_eq!(find.phase, SearchPhase::Done);

        let mut listen = SearchState::new(target, SearchKind::Listen, vec![n1]);
        listen.next_batch();
        listen.advance_if_converged();
        assert_eq!(listen.phase, SearchPhase::Converged);
        assert!(!listen.is_terminal());
    }

    #[test]
    fn offer_ignores_duplicates_and_already_queried() {
        let target = IdHash::hash(b"target");
        let n1 = node(IdHash::hash(b"dup"), 5001);
        let mut search = SearchState::new(target, SearchKind::FindNode, vec![n1.clone()]);
        search.offer(n1.clone());
        assert_eq!(search.closest_k(10).len(), 1);
        search.next_batch();
        search.offer(n1);
        assert_eq!(search.closest_k(10).len(), 1);
    }
}
