//! Process-wide runtime counters: lock-free `AtomicU64` fields bumped
//! from call sites that already hold no other lock, read back into an
//! `event` notification payload rather than exposed as their own RPC
//! method.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct RuntimeMetrics {
    pub sandboxes_created: AtomicU64,
    pub sandboxes_failed: AtomicU64,
    pub total_exec_calls: AtomicU64,
    pub total_exec_errors: AtomicU64,
}

/// Snapshot shape for the `event` notification payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeMetricsSnapshot {
    pub sandboxes_created: u64,
    pub sandboxes_failed: u64,
    pub total_exec_calls: u64,
    pub total_exec_errors: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sandbox_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_failed(&self) {
        self.sandboxes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exec(&self, is_error: bool) {
        self.total_exec_calls.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.total_exec_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RuntimeMetricsSnapshot {
        RuntimeMetricsSnapshot {
            sandboxes_created: self.sandboxes_created.load(Ordering::Relaxed),
            sandboxes_failed: self.sandboxes_failed.load(Ordering::Relaxed),
            total_exec_calls: self.total_exec_calls.load(Ordering::Relaxed),
            total_exec_errors: self.total_exec_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = RuntimeMetrics::new();
        metrics.record_sandbox_created();
        metrics.record_sandbox_created();
        metrics.record_sandbox_failed();
        metrics.record_exec(false);
        metrics.record_exec(true);

        let snap = metrics.snapshot();
        assert_eq!(snap.sandboxes_created, 2);
        assert_eq!(snap.sandboxes_failed, 1);
        assert_eq!(snap.total_exec_calls, 2);
        assert_eq!(snap.total_exec_errors, 1);
    }
}
