//! Storage element metrics.
//!
//! Plain atomic counters and gauges rendered in the Prometheus text
//! exposition format by [`ElementMetrics::export_prometheus`].

use durafile_common::CleanupReason;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and gauges for one storage element
#[derive(Debug, Default)]
pub struct ElementMetrics {
    // Finalizer
    pub finalize_prepared: AtomicU64,
    pub finalize_committed: AtomicU64,
    pub finalize_aborted: AtomicU64,
    /// Alertable: a transaction needs operator attention
    pub finalize_failed: AtomicU64,
    pub finalize_recovered: AtomicU64,

    // Cache rebuild
    pub rebuild_full_runs: AtomicU64,
    pub rebuild_incremental_runs: AtomicU64,
    pub rebuild_upserts: AtomicU64,
    pub rebuild_deletes: AtomicU64,
    pub cache_lazy_refreshes: AtomicU64,

    // Garbage collector
    pub gc_runs: AtomicU64,
    pub gc_runs_skipped: AtomicU64,
    pub gc_deleted_ttl_expired: AtomicU64,
    pub gc_deleted_finalized_safe: AtomicU64,
    pub gc_deleted_orphaned: AtomicU64,
    pub gc_failures: AtomicU64,
    pub gc_dropped: AtomicU64,
    pub gc_queue_depth: AtomicU64,

    // Capacity monitor
    pub capacity_polls: AtomicU64,
    pub capacity_poll_errors: AtomicU64,
    pub capacity_fallback_polls: AtomicU64,
    pub leadership_changes: AtomicU64,
    pub capacity_is_leader: AtomicU64,
    pub capacity_interval_secs: AtomicU64,
    pub capacity_total_bytes: AtomicU64,
    pub capacity_used_bytes: AtomicU64,

    pub lock_contention: AtomicU64,
    /// Run locks lost before the run finished
    pub lock_leases_lost: AtomicU64,
    /// Background runs cut off at their deadline
    pub jobs_abandoned: AtomicU64,
}

impl ElementMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn record_gc_deleted(&self, reason: CleanupReason) {
        Self::inc(match reason {
            CleanupReason::TtlExpired => &self.gc_deleted_ttl_expired,
            CleanupReason::FinalizedSafe => &self.gc_deleted_finalized_safe,
            CleanupReason::Orphaned => &self.gc_deleted_orphaned,
        });
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self, element_id: &str) -> String {
        let mut output = String::with_capacity(4 * 1024);
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let counters = [
            ("durafile_finalize_prepared_total", "Finalize transactions prepared", &self.finalize_prepared),
            ("durafile_finalize_committed_total", "Finalize transactions committed", &self.finalize_committed),
            ("durafile_finalize_aborted_total", "Finalize transactions rolled back", &self.finalize_aborted),
            ("durafile_finalize_failed_total", "Finalize transactions marked FAILED", &self.finalize_failed),
            ("durafile_finalize_recovered_total", "Transactions committed by the recovery sweep", &self.finalize_recovered),
            ("durafile_cache_rebuild_upserts_total", "Cache rows written by rebuilds", &self.rebuild_upserts),
            ("durafile_cache_rebuild_deletes_total", "Cache rows removed by rebuilds", &self.rebuild_deletes),
            ("durafile_cache_lazy_refreshes_total", "Stale cache rows refreshed on read", &self.cache_lazy_refreshes),
            ("durafile_gc_runs_total", "Garbage collection runs", &self.gc_runs),
            ("durafile_gc_runs_skipped_total", "Runs skipped because another replica held the GC lock", &self.gc_runs_skipped),
            ("durafile_gc_failures_total", "Cleanup entries that failed all in-run attempts", &self.gc_failures),
            ("durafile_gc_dropped_total", "Candidates dropped by the queue capacity bound", &self.gc_dropped),
            ("durafile_capacity_polls_total", "Backend capacity polls by the leader", &self.capacity_polls),
            ("durafile_capacity_poll_errors_total", "Failed backend capacity polls", &self.capacity_poll_errors),
            ("durafile_capacity_fallback_polls_total", "Direct capacity polls without a valid snapshot", &self.capacity_fallback_polls),
            ("durafile_leadership_changes_total", "Capacity leadership acquisitions and demotions", &self.leadership_changes),
            ("durafile_lock_contention_total", "Lock acquisitions refused as busy", &self.lock_contention),
            ("durafile_lock_leases_lost_total", "Runs ended early because their lock lease lapsed", &self.lock_leases_lost),
            ("durafile_jobs_abandoned_total", "Background runs abandoned at their deadline", &self.jobs_abandoned),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name}{{element_id=\"{element_id}\"}} {}", load(counter));
        }

        let _ = writeln!(output, "# HELP durafile_cache_rebuild_runs_total Cache rebuild runs by mode");
        let _ = writeln!(output, "# TYPE durafile_cache_rebuild_runs_total counter");
        for (mode, counter) in [("full", &self.rebuild_full_runs), ("incremental", &self.rebuild_incremental_runs)] {
            let _ = writeln!(
                output,
                "durafile_cache_rebuild_runs_total{{element_id=\"{element_id}\",mode=\"{mode}\"}} {}",
                load(counter)
            );
        }

        let _ = writeln!(output, "# HELP durafile_gc_deleted_total Stored copies deleted by reason");
        let _ = writeln!(output, "# TYPE durafile_gc_deleted_total counter");
        for (reason, counter) in [
            (CleanupReason::TtlExpired, &self.gc_deleted_ttl_expired),
            (CleanupReason::FinalizedSafe, &self.gc_deleted_finalized_safe),
            (CleanupReason::Orphaned, &self.gc_deleted_orphaned),
        ] {
            let _ = writeln!(
                output,
                "durafile_gc_deleted_total{{element_id=\"{element_id}\",reason=\"{reason}\"}} {}",
                load(counter)
            );
        }

        let gauges = [
            ("durafile_gc_queue_depth", "Entries waiting in the cleanup queue", &self.gc_queue_depth),
            ("durafile_capacity_leader", "1 if this replica leads capacity polling", &self.capacity_is_leader),
            ("durafile_capacity_poll_interval_seconds", "Current adaptive poll interval", &self.capacity_interval_secs),
            ("durafile_capacity_total_bytes", "Backend capacity at the last poll", &self.capacity_total_bytes),
            ("durafile_capacity_used_bytes", "Backend usage at the last poll", &self.capacity_used_bytes),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} gauge");
            let _ = writeln!(output, "{name}{{element_id=\"{element_id}\"}} {}", load(gauge));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_alert_counter() {
        let metrics = ElementMetrics::new();
        ElementMetrics::inc(&metrics.finalize_failed);
        metrics.record_gc_deleted(CleanupReason::FinalizedSafe);
        ElementMetrics::set(&metrics.gc_queue_depth, 7);
        ElementMetrics::inc(&metrics.jobs_abandoned);

        let text = metrics.export_prometheus("se-1");
        assert!(text.contains("# TYPE durafile_finalize_failed_total counter"));
        assert!(text.contains("durafile_finalize_failed_total{element_id=\"se-1\"} 1"));
        assert!(text.contains(
            "durafile_gc_deleted_total{element_id=\"se-1\",reason=\"FINALIZED_SAFE\"} 1"
        ));
        assert!(text.contains("durafile_gc_queue_depth{element_id=\"se-1\"} 7"));
        assert!(text.contains("durafile_jobs_abandoned_total{element_id=\"se-1\"} 1"));
    }
}
