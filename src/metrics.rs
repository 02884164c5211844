use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::{json, Value};

/// Lock event counters. Updated by the lock manager, read by `STATS` and the
/// periodic stats log.
#[derive(Debug, Default)]
pub struct LockMetrics {
    pub granted_immediately: AtomicU64,
    pub granted_on_replay: AtomicU64,
    pub already_held: AtomicU64,
    pub queued: AtomicU64,
    pub released: AtomicU64,
    pub release_rejected: AtomicU64,
    pub expired: AtomicU64,
    pub stale_timers: AtomicU64,
    pub disconnected_waiters: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub wrong_type: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub granted_immediately: u64,
    pub granted_on_replay: u64,
    pub already_held: u64,
    pub queued: u64,
    pub released: u64,
    pub release_rejected: u64,
    pub expired: u64,
    pub stale_timers: u64,
    pub disconnected_waiters: u64,
    pub protocol_violations: u64,
    pub wrong_type: u64,
}

impl MetricsSnapshot {
    pub fn total_grants(&self) -> u64 {
        self.granted_immediately + self.granted_on_replay
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            granted_immediately: self.granted_immediately.load(Ordering::Relaxed),
            granted_on_replay: self.granted_on_replay.load(Ordering::Relaxed),
            already_held: self.already_held.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            release_rejected: self.release_rejected.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            stale_timers: self.stale_timers.load(Ordering::Relaxed),
            disconnected_waiters: self.disconnected_waiters.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            wrong_type: self.wrong_type.load(Ordering::Relaxed),
        }
    }
}

/// Metrics plus live gauges, as served by `STATS`.
pub fn stats_json(snapshot: &MetricsSnapshot, locks: usize, blocked_clients: usize, armed_timers: usize) -> Value {
    json!({
        "locks": locks,
        "blocked_clients": blocked_clients,
        "armed_timers": armed_timers,
        "total_grants": snapshot.total_grants(),
        "counters": snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = LockMetrics::new();
        bump(&metrics.granted_immediately);
        bump(&metrics.granted_on_replay);
        bump(&metrics.granted_on_replay);
        bump(&metrics.expired);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.granted_immediately, 1);
        assert_eq!(snapshot.granted_on_replay, 2);
        assert_eq!(snapshot.total_grants(), 3);
        assert_eq!(snapshot.expired, 1);
        assert_eq!(snapshot.released, 0);
    }

    #[test]
    fn test_stats_json_shape() {
        let metrics = LockMetrics::new();
        bump(&metrics.queued);

        let value = stats_json(&metrics.snapshot(), 2, 1, 2);
        assert_eq!(value["locks"], 2);
        assert_eq!(value["blocked_clients"], 1);
        assert_eq!(value["armed_timers"], 2);
        assert_eq!(value["total_grants"], 0);
        assert_eq!(value["counters"]["queued"], 1);
    }
}
