//! Metrics collection for faultline.
//!
//! Counts what the work-item engine does so a metrics sink can scrape it:
//! dispatcher outcomes, lock traffic, plugin faults and outgoing mail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS.get_or_init(|| Arc::new(Metrics::new()))
}

/// Initialize global metrics with custom instance.
pub fn init_metrics(metrics: Arc<Metrics>) -> Result<(), Arc<Metrics>> {
    METRICS.set(metrics)
}

/// Work-item engine metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Work Item Metrics ===
    /// Work items dequeued
    pub work_items_received: AtomicU64,
    /// Work items acknowledged after success
    pub work_items_completed: AtomicU64,
    /// Handler invocations that returned an error
    pub work_items_failed: AtomicU64,
    /// Work items abandoned for redelivery
    pub work_items_abandoned: AtomicU64,
    /// Work items moved to the dead letter list
    pub work_items_dead_lettered: AtomicU64,
    /// Progress updates published
    pub progress_reports: AtomicU64,

    // === Lock Metrics ===
    pub locks_acquired: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub locks_renewed: AtomicU64,
    pub locks_lost: AtomicU64,
    pub locks_released: AtomicU64,
    /// Throttled grants handed out
    pub throttle_grants: AtomicU64,
    /// Throttled acquisitions refused because the window was full
    pub throttle_denials: AtomicU64,

    // === Plugin Metrics ===
    /// Formatting plugin capabilities that returned an error
    pub plugin_faults: AtomicU64,

    // === Mail Metrics ===
    pub mails_sent: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            work_items_received: AtomicU64::new(0),
            work_items_completed: AtomicU64::new(0),
            work_items_failed: AtomicU64::new(0),
            work_items_abandoned: AtomicU64::new(0),
            work_items_dead_lettered: AtomicU64::new(0),
            progress_reports: AtomicU64::new(0),

            locks_acquired: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            locks_renewed: AtomicU64::new(0),
            locks_lost: AtomicU64::new(0),
            locks_released: AtomicU64::new(0),
            throttle_grants: AtomicU64::new(0),
            throttle_denials: AtomicU64::new(0),

            plugin_faults: AtomicU64::new(0),

            mails_sent: AtomicU64::new(0),
        }
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            work_items_received: self.work_items_received.load(Ordering::Relaxed),
            work_items_completed: self.work_items_completed.load(Ordering::Relaxed),
            work_items_failed: self.work_items_failed.load(Ordering::Relaxed),
            work_items_abandoned: self.work_items_abandoned.load(Ordering::Relaxed),
            work_items_dead_lettered: self.work_items_dead_lettered.load(Ordering::Relaxed),
            progress_reports: self.progress_reports.load(Ordering::Relaxed),

            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            locks_renewed: self.locks_renewed.load(Ordering::Relaxed),
            locks_lost: self.locks_lost.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            throttle_grants: self.throttle_grants.load(Ordering::Relaxed),
            throttle_denials: self.throttle_denials.load(Ordering::Relaxed),

            plugin_faults: self.plugin_faults.load(Ordering::Relaxed),

            mails_sent: self.mails_sent.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters: [(&str, &str, u64); 15] = [
            ("work_items_received", "Work items dequeued", snapshot.work_items_received),
            ("work_items_completed", "Work items completed", snapshot.work_items_completed),
            ("work_items_failed", "Handler failures", snapshot.work_items_failed),
            ("work_items_abandoned", "Work items abandoned for redelivery", snapshot.work_items_abandoned),
            ("work_items_dead_lettered", "Work items dead-lettered", snapshot.work_items_dead_lettered),
            ("progress_reports", "Progress updates published", snapshot.progress_reports),
            ("locks_acquired", "Locks acquired", snapshot.locks_acquired),
            ("lock_timeouts", "Lock acquisitions that timed out", snapshot.lock_timeouts),
            ("locks_renewed", "Lock renewals", snapshot.locks_renewed),
            ("locks_lost", "Locks lost before renewal", snapshot.locks_lost),
            ("locks_released", "Locks released", snapshot.locks_released),
            ("throttle_grants", "Throttled grants", snapshot.throttle_grants),
            ("throttle_denials", "Throttled denials", snapshot.throttle_denials),
            ("plugin_faults", "Formatting plugin faults", snapshot.plugin_faults),
            ("mails_sent", "Notification mails sent", snapshot.mails_sent),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP faultline_{name} {help}\n"));
            output.push_str(&format!("# TYPE faultline_{name} counter\n"));
            output.push_str(&format!("faultline_{name} {value}\n"));
        }
        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    // Work items
    pub work_items_received: u64,
    pub work_items_completed: u64,
    pub work_items_failed: u64,
    pub work_items_abandoned: u64,
    pub work_items_dead_lettered: u64,
    pub progress_reports: u64,

    // Locks
    pub locks_acquired: u64,
    pub lock_timeouts: u64,
    pub locks_renewed: u64,
    pub locks_lost: u64,
    pub locks_released: u64,
    pub throttle_grants: u64,
    pub throttle_denials: u64,

    // Plugins
    pub plugin_faults: u64,

    // Mail
    pub mails_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.work_items_received.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.locks_acquired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.work_items_completed);
        Metrics::incr(&metrics.work_items_completed);
        Metrics::incr(&metrics.lock_timeouts);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.work_items_completed, 2);
        assert_eq!(snapshot.lock_timeouts, 1);
        assert_eq!(snapshot.locks_lost, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.locks_acquired);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("faultline_locks_acquired 1"));
        assert!(prometheus.contains("# TYPE faultline_plugin_faults counter"));
    }
}
