//! Clock abstraction (spec.md §9 design notes).
//!
//! The core never reads wall-clock time directly except through this
//! trait, so a deterministic recording/replay driver can substitute a
//! virtual clock alongside `Network::inject_packet` without touching any
//! other module.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Monotonic-enough timestamp, seconds since the Unix epoch. Good enough
/// resolution for TTLs, timeouts, and scheduling; sub-second jitter is
/// absorbed by the event loop's select timeout, not by this type.
pub type Timestamp = u64;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Real wall-clock time, used by `Runner::run` in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock a deterministic test or replay driver can advance by hand.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl VirtualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_secs(), std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, ts: Timestamp) {
        self.now.store(ts, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Timestamp {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_advances() {
        let clock = VirtualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now(), 1_030);
    }
}
