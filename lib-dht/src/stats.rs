//! Diagnostic counters surfaced to an embedding application (spec.md
//! §4.H), grounded in the simple atomic-counter `Stats` pattern the
//! teacher's storage and network layers each keep privately — collected
//! here into one place callers can snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub malformed_packets: AtomicU64,
    pub permission_denied: AtomicU64,
    pub search_failures: AtomicU64,
    pub value_rejections: AtomicU64,
    pub local_overflows: AtomicU64,
    pub timeouts: AtomicU64,
    pub puts: AtomicU64,
    pub gets: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub malformed_packets: u64,
    pub permission_denied: u64,
    pub search_failures: u64,
    pub value_rejections: u64,
    pub local_overflows: u64,
    pub timeouts: u64,
    pub puts: u64,
    pub gets: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            permission_denied: self.permission_denied.load(Ordering::Relaxed),
            search_failures: self.search_failures.load(Ordering::Relaxed),
            value_rejections: self.value_rejections.load(Ordering::Relaxed),
            local_overflows: self.local_overflows.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let stats = Stats::default();
        Stats::incr(&stats.puts);
        Stats::incr(&stats.puts);
        assert_eq!(stats.snapshot().puts, 2);
        assert_eq!(stats.snapshot().gets, 0);
    }
}
