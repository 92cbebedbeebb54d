//! Progress reporting for long-running copies.
//!
//! The copy orchestrator announces the total node count once, then reports
//! every unit it materializes. Reporting is fire-and-forget.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sink for copy progress.
pub trait ProgressReporter: Send + Sync {
    fn set_total(&self, total: u64);
    fn increment(&self, count: u64);
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn set_total(&self, _total: u64) {}
    fn increment(&self, _count: u64) {}
}

/// Point-in-time view of a [`ProgressTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total: u64,
    pub done: u64,
}

impl ProgressSnapshot {
    /// Percentage complete, 100 when nothing is expected.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.done as f64 / self.total as f64) * 100.0
        }
    }
}

/// Thread-safe counters; clones share state.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    total: Arc<AtomicU64>,
    done: Arc<AtomicU64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::SeqCst),
            done: self.done.load(Ordering::SeqCst),
        }
    }
}

impl ProgressReporter for ProgressTracker {
    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    fn increment(&self, count: u64) {
        self.done.fetch_add(count, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_clones_share_counters() {
        let tracker = ProgressTracker::new();
        let reporter: Arc<dyn ProgressReporter> = Arc::new(tracker.clone());

        reporter.set_total(4);
        reporter.increment(1);
        reporter.increment(3);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot, ProgressSnapshot { total: 4, done: 4 });
        assert_eq!(snapshot.percent(), 100.0);
    }

    #[test]
    fn test_empty_snapshot_is_complete() {
        assert_eq!(ProgressTracker::new().snapshot().percent(), 100.0);
    }
}
