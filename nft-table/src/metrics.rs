//! Per-table counters and gauges.
//!
//! Plain atomics rather than a registry: the host owns process-wide metric
//! registration and scrapes snapshots from here at whatever cadence it
//! likes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TableMetrics {
    read_calls: AtomicU64,
    read_errors: AtomicU64,
    write_calls: AtomicU64,
    write_errors: AtomicU64,
    lines_executed: AtomicU64,
    num_chains: AtomicU64,
    num_rules: AtomicI64,
}

impl TableMetrics {
    pub fn new() -> TableMetrics {
        TableMetrics::default()
    }

    pub(crate) fn inc_read_calls(&self) {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_read_errors(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_write_calls(&self) {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_write_errors(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_lines_executed(&self, n: u64) {
        self.lines_executed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn set_num_chains(&self, n: u64) {
        self.num_chains.store(n, Ordering::Relaxed);
    }

    pub(crate) fn add_rules(&self, delta: i64) {
        self.num_rules.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_calls: self.read_calls.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_calls: self.write_calls.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            lines_executed: self.lines_executed.load(Ordering::Relaxed),
            num_chains: self.num_chains.load(Ordering::Relaxed),
            num_rules: self.num_rules.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a table's metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub read_calls: u64,
    pub read_errors: u64,
    pub write_calls: u64,
    pub write_errors: u64,
    pub lines_executed: u64,
    pub num_chains: u64,
    pub num_rules: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = TableMetrics::new();
        metrics.inc_read_calls();
        metrics.inc_write_calls();
        metrics.inc_write_calls();
        metrics.add_lines_executed(7);
        metrics.set_num_chains(3);
        metrics.add_rules(5);
        metrics.add_rules(-2);
        let snap = metrics.snapshot();
        assert_eq!(snap.read_calls, 1);
        assert_eq!(snap.write_calls, 2);
        assert_eq!(snap.lines_executed, 7);
        assert_eq!(snap.num_chains, 3);
        assert_eq!(snap.num_rules, 3);
    }
}
