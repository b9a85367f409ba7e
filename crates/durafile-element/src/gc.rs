//! Garbage collector.
//!
//! Each run computes three candidate sets independently:
//!
//! - `TTL_EXPIRED`: `EDIT` copies mirrored by the cache and untouched for
//!   longer than the edit retention
//! - `FINALIZED_SAFE`: source copies of committed transactions once the
//!   safety margin after `committed_at` has passed
//! - `ORPHANED`: descriptors older than the orphan grace whose file has
//!   neither a cache row nor any finalize transaction
//!
//! Files with an open or failed finalize transaction are never candidates.
//! Candidates are merged into the persistent cleanup queue (bounded, the
//! lowest priority dropped first) and a batch of eligible entries is
//! re-validated and deleted under the per-file lock. A run holds the
//! `gc/run` lock for its whole duration; replicas that cannot get it skip
//! the run.

use crate::metrics::ElementMetrics;
use crate::task::PeriodicJob;
use crate::{hold_lease, lock_file, note_contention, release_lock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durafile_common::clock::to_chrono;
use durafile_common::config::GcConfig;
use durafile_common::{CleanupReason, Clock, Descriptor, Error, FileId, Result, StorageMode};
use durafile_coord::{GC_LOCK_KEY, LockKind, LockManager, LockPriority};
use durafile_meta_store::{CleanupEntry, FinalizeTransaction, MetadataStore, TransactionStatus};
use durafile_storage::{StorageBackend, StorageError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cap on the exponent of the between-run backoff
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Entry that exhausted its in-run attempts
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GcFailure {
    pub file_id: FileId,
    pub location: String,
    pub reason: CleanupReason,
    pub error: String,
}

/// Outcome of one collection run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Another replica held the run lock
    pub skipped: bool,
    pub candidates: usize,
    pub enqueued: usize,
    /// Dropped by the queue capacity bound
    pub dropped: usize,
    pub processed: usize,
    pub deleted_ttl_expired: usize,
    pub deleted_finalized_safe: usize,
    pub deleted_orphaned: usize,
    /// Entries no longer valid at deletion time
    pub invalidated: usize,
    /// Entries left queued because their file was locked
    pub deferred: usize,
    pub failures: Vec<GcFailure>,
}

impl GcReport {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            finished_at: now,
            skipped: false,
            candidates: 0,
            enqueued: 0,
            dropped: 0,
            processed: 0,
            deleted_ttl_expired: 0,
            deleted_finalized_safe: 0,
            deleted_orphaned: 0,
            invalidated: 0,
            deferred: 0,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub const fn deleted(&self) -> usize {
        self.deleted_ttl_expired + self.deleted_finalized_safe + self.deleted_orphaned
    }

    fn record_deleted(&mut self, reason: CleanupReason) {
        match reason {
            CleanupReason::TtlExpired => self.deleted_ttl_expired += 1,
            CleanupReason::FinalizedSafe => self.deleted_finalized_safe += 1,
            CleanupReason::Orphaned => self.deleted_orphaned += 1,
        }
    }
}

/// Outcome of an explicit file deletion
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub file_id: FileId,
    /// Backend locations removed, staged copies included
    pub locations: Vec<String>,
    pub cache_row_removed: bool,
    pub queue_entries_removed: usize,
}

enum Validation {
    Valid(Option<FinalizeTransaction>),
    Invalid(String),
}

enum EntryOutcome {
    Deleted,
    Invalidated,
    Deferred,
    Failed(GcFailure),
}

/// Prioritized reclamation of stored copies
pub struct GarbageCollector {
    backend: Arc<dyn StorageBackend>,
    meta: Arc<dyn MetadataStore>,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    config: GcConfig,
    safety_margin: Duration,
    metrics: Arc<ElementMetrics>,
}

impl GarbageCollector {
    /// `safety_margin` is how long a committed file's source copy is kept.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        meta: Arc<dyn MetadataStore>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        config: GcConfig,
        safety_margin: Duration,
        metrics: Arc<ElementMetrics>,
    ) -> Self {
        Self {
            backend,
            meta,
            locks,
            clock,
            config,
            safety_margin,
            metrics,
        }
    }

    /// One collection run. Skipped when another replica is collecting.
    pub async fn run(&self) -> Result<GcReport> {
        let guard = match self
            .locks
            .acquire(GC_LOCK_KEY, LockKind::Exclusive, LockPriority::Normal)
            .await
        {
            Ok(guard) => guard,
            Err(e @ Error::LockContention { .. }) => {
                note_contention(&self.metrics, &e);
                ElementMetrics::inc(&self.metrics.gc_runs_skipped);
                info!("Skipping GC run: another replica holds {}", GC_LOCK_KEY);
                let mut report = GcReport::new(self.clock.now());
                report.skipped = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        let result = hold_lease(&guard, &self.metrics, self.run_locked()).await;
        release_lock(guard).await;
        result
    }

    async fn run_locked(&self) -> Result<GcReport> {
        let now = self.clock.now();
        let mut report = GcReport::new(now);

        let candidates = self.collect_candidates(now).await?;
        report.candidates = candidates.len();
        self.enqueue(candidates, &mut report)?;

        let mut batch: Vec<CleanupEntry> = self
            .meta
            .load_cleanup_queue()?
            .into_iter()
            .filter(|e| e.is_eligible(now))
            .collect();
        batch.sort_by_key(|e| (e.priority, e.enqueued_at));
        batch.truncate(self.config.batch_size);

        for entry in batch {
            report.processed += 1;
            let reason = entry.reason;
            match self.process_entry(entry).await {
                EntryOutcome::Deleted => report.record_deleted(reason),
                EntryOutcome::Invalidated => report.invalidated += 1,
                EntryOutcome::Deferred => report.deferred += 1,
                EntryOutcome::Failed(failure) => report.failures.push(failure),
            }
        }

        let depth = self.meta.load_cleanup_queue()?.len();
        ElementMetrics::set(&self.metrics.gc_queue_depth, depth as u64);
        ElementMetrics::inc(&self.metrics.gc_runs);
        report.finished_at = self.clock.now();
        info!(
            "GC run: candidates={} enqueued={} dropped={} deleted={} invalidated={} deferred={} failed={}",
            report.candidates,
            report.enqueued,
            report.dropped,
            report.deleted(),
            report.invalidated,
            report.deferred,
            report.failures.len()
        );
        Ok(report)
    }

    async fn collect_candidates(&self, now: DateTime<Utc>) -> Result<Vec<CleanupEntry>> {
        let txns = self.meta.load_txns()?;
        // Open or failed transactions pin every copy of their file
        let protected: HashSet<FileId> = txns
            .iter()
            .filter(|t| t.status.protects_file())
            .map(|t| t.file_id)
            .collect();
        let rows = self.meta.load_cache_rows()?;
        let mut found: HashMap<String, CleanupEntry> = HashMap::new();
        let mut add = |file_id: FileId, location: &str, reason: CleanupReason| {
            if protected.contains(&file_id) {
                return;
            }
            let entry = CleanupEntry::new(
                file_id,
                location,
                reason,
                self.config.priority_of(reason),
                now,
            );
            match found.get(&entry.key()) {
                Some(existing) if existing.priority <= entry.priority => {}
                _ => {
                    found.insert(entry.key(), entry);
                }
            }
        };

        let retention = to_chrono(self.config.edit_retention());
        for row in &rows {
            if row.mode() == StorageMode::Edit && now - row.descriptor.modified_at >= retention {
                add(row.file_id(), row.location(), CleanupReason::TtlExpired);
            }
        }

        let margin = to_chrono(self.safety_margin);
        for txn in &txns {
            if self.is_reclaimable(txn, now, margin) {
                add(txn.file_id, &txn.source_location, CleanupReason::FinalizedSafe);
            }
        }

        // A file the transaction log knows is never an orphan, row or not
        let mirrored: HashSet<FileId> = rows
            .iter()
            .map(|r| r.file_id())
            .chain(txns.iter().map(|t| t.file_id))
            .collect();
        let grace = to_chrono(self.config.orphan_grace());
        for desc in self.backend.list("").await? {
            if !desc.is_staged()
                && !mirrored.contains(&desc.file_id)
                && now - desc.modified_at > grace
            {
                add(desc.file_id, &desc.location, CleanupReason::Orphaned);
            }
        }

        let mut candidates: Vec<CleanupEntry> = found.into_values().collect();
        candidates.sort_by_key(|e| (e.priority, e.key()));
        Ok(candidates)
    }

    fn is_reclaimable(
        &self,
        txn: &FinalizeTransaction,
        now: DateTime<Utc>,
        margin: chrono::Duration,
    ) -> bool {
        txn.status == TransactionStatus::Committed
            && txn.source_reclaimed_at.is_none()
            && txn.committed_at.is_some_and(|at| now - at >= margin)
    }

    /// Merge candidates into the queue, keeping it within capacity.
    fn enqueue(&self, candidates: Vec<CleanupEntry>, report: &mut GcReport) -> Result<()> {
        let queued = self.meta.load_cleanup_queue()?;
        let known: HashSet<String> = queued.iter().map(CleanupEntry::key).collect();

        let mut all: Vec<(CleanupEntry, bool)> = queued.into_iter().map(|e| (e, false)).collect();
        all.extend(
            candidates
                .into_iter()
                .filter(|c| !known.contains(&c.key()))
                .map(|c| (c, true)),
        );
        all.sort_by_key(|(e, _)| (e.priority, e.enqueued_at));

        for (i, (entry, is_new)) in all.into_iter().enumerate() {
            if i < self.config.queue_capacity {
                if is_new {
                    self.meta.put_cleanup_entry(&entry)?;
                    report.enqueued += 1;
                }
                continue;
            }
            if !is_new {
                self.meta.delete_cleanup_entry(entry.file_id, &entry.location)?;
            }
            report.dropped += 1;
            debug!(
                "Cleanup queue full, dropping {} {} ({})",
                entry.file_id, entry.location, entry.reason
            );
        }
        ElementMetrics::add(&self.metrics.gc_dropped, report.dropped as u64);
        Ok(())
    }

    async fn process_entry(&self, entry: CleanupEntry) -> EntryOutcome {
        let guard = match lock_file(&self.locks, &self.metrics, entry.file_id).await {
            Ok(guard) => guard,
            Err(e) => {
                debug!("Deferring cleanup of {}: {}", entry.location, e);
                return EntryOutcome::Deferred;
            }
        };
        let outcome = self.process_entry_locked(entry).await;
        release_lock(guard).await;
        outcome
    }

    async fn process_entry_locked(&self, mut entry: CleanupEntry) -> EntryOutcome {
        let now = self.clock.now();
        let validation = match self.revalidate(&entry, now).await {
            Ok(v) => v,
            Err(e) => return self.record_failure(&mut entry, now, &e),
        };
        let txn = match validation {
            Validation::Valid(txn) => txn,
            Validation::Invalid(why) => {
                debug!("Dropping cleanup of {} {}: {}", entry.file_id, entry.location, why);
                if let Err(e) = self.meta.delete_cleanup_entry(entry.file_id, &entry.location) {
                    warn!("Failed to drop cleanup entry {}: {}", entry.key(), e);
                }
                return EntryOutcome::Invalidated;
            }
        };

        if let Err(e) = self.delete_with_retry(&entry.location).await {
            return self.record_failure(&mut entry, now, &e);
        }

        let txn = txn.map(|mut t| {
            t.source_reclaimed_at = Some(now);
            t
        });
        match self.meta.complete_cleanup(&entry, txn.as_ref()) {
            Ok(_) => {
                self.metrics.record_gc_deleted(entry.reason);
                info!(
                    "GC deleted {} copy of {} at {}",
                    entry.reason, entry.file_id, entry.location
                );
                EntryOutcome::Deleted
            }
            Err(e) => self.record_failure(&mut entry, now, &e.into()),
        }
    }

    /// Re-check an entry against the current state before deleting.
    async fn revalidate(&self, entry: &CleanupEntry, now: DateTime<Utc>) -> Result<Validation> {
        let txns = self.meta.txns_for_file(entry.file_id)?;
        if txns.iter().any(|t| t.status.protects_file()) {
            return Ok(Validation::Invalid("finalize transaction open or failed".into()));
        }
        let desc = match self.backend.get_descriptor(&entry.location).await {
            Ok(d) if d.file_id == entry.file_id => Some(d),
            Ok(_) => return Ok(Validation::Invalid("location now holds another file".into())),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let row = self.meta.get_cache_row(entry.file_id)?;

        match entry.reason {
            CleanupReason::TtlExpired => {
                let retention = to_chrono(self.config.edit_retention());
                let expired = row.as_ref().is_some_and(|r| {
                    r.mode() == StorageMode::Edit
                        && r.location() == entry.location
                        && now - modified_at(desc.as_ref(), &r.descriptor) >= retention
                });
                if expired {
                    Ok(Validation::Valid(None))
                } else {
                    Ok(Validation::Invalid("no longer an expired EDIT copy".into()))
                }
            }
            CleanupReason::FinalizedSafe => {
                let margin = to_chrono(self.safety_margin);
                let Some(txn) = txns.into_iter().find(|t| {
                    t.source_location == entry.location && self.is_reclaimable(t, now, margin)
                }) else {
                    return Ok(Validation::Invalid("no reclaimable committed transaction".into()));
                };
                // Never drop the source before the finalized copy is readable
                match self.backend.get_descriptor(&txn.target_location).await {
                    Ok(t) if t.file_id == txn.file_id && t.mode == txn.target_mode => {
                        Ok(Validation::Valid(Some(txn)))
                    }
                    Ok(_) | Err(StorageError::NotFound(_)) => {
                        error!(
                            "Target copy {} of committed file {} is missing; keeping source {}",
                            txn.target_location, txn.file_id, entry.location
                        );
                        Ok(Validation::Invalid("target copy missing".into()))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            CleanupReason::Orphaned => {
                if !txns.is_empty() {
                    return Ok(Validation::Invalid("file has finalize history".into()));
                }
                let grace = to_chrono(self.config.orphan_grace());
                match (&row, &desc) {
                    (None, Some(d)) if now - d.modified_at > grace => Ok(Validation::Valid(None)),
                    (None, None) => Ok(Validation::Valid(None)),
                    _ => Ok(Validation::Invalid("no longer an orphan".into())),
                }
            }
        }
    }

    async fn delete_with_retry(&self, location: &str) -> Result<()> {
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 1;
        loop {
            match self.backend.delete_if_exists(location).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    let err: Error = e.into();
                    if !err.is_retryable() || attempt >= self.config.max_attempts {
                        return Err(err);
                    }
                    debug!("Delete of {} failed (attempt {}): {}", location, attempt, err);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
            attempt += 1;
        }
    }

    fn record_failure(
        &self,
        entry: &mut CleanupEntry,
        now: DateTime<Utc>,
        err: &Error,
    ) -> EntryOutcome {
        entry.attempts += 1;
        entry.last_error = Some(err.to_string());
        let exponent = (entry.attempts - 1).min(MAX_BACKOFF_EXPONENT);
        entry.next_eligible_at = now + to_chrono(self.config.interval() * (1u32 << exponent));
        if let Err(e) = self.meta.put_cleanup_entry(entry) {
            warn!("Failed to requeue cleanup entry {}: {}", entry.key(), e);
        }
        ElementMetrics::inc(&self.metrics.gc_failures);
        warn!(
            "GC failed to delete {} {} (attempt {}): {}",
            entry.file_id, entry.location, entry.attempts, err
        );
        EntryOutcome::Failed(GcFailure {
            file_id: entry.file_id,
            location: entry.location.clone(),
            reason: entry.reason,
            error: err.to_string(),
        })
    }

    /// Remove every stored copy of a file with its cache row and queue entries.
    ///
    /// Deleting a file that is already gone succeeds with an empty report.
    pub async fn delete(&self, file_id: FileId) -> Result<DeleteReport> {
        let guard = lock_file(&self.locks, &self.metrics, file_id).await?;
        let result = self.delete_locked(file_id).await;
        release_lock(guard).await;
        result
    }

    async fn delete_locked(&self, file_id: FileId) -> Result<DeleteReport> {
        if let Some(open) = self
            .meta
            .txns_for_file(file_id)?
            .into_iter()
            .find(|t| t.status.is_in_flight())
        {
            return Err(Error::InFlight {
                file_id,
                txn_id: open.txn_id,
            });
        }

        let copies: Vec<String> = self
            .backend
            .list("")
            .await?
            .into_iter()
            .filter(|d| d.file_id == file_id)
            .map(|d| d.location)
            .collect();

        for location in &copies {
            self.delete_with_retry(location).await?;
        }
        let cache_row_removed = self.meta.delete_cache_row(file_id)?;
        let queue_entries_removed = self.meta.delete_cleanup_entries_for_file(file_id)?;
        info!("Deleted file {} ({} copies)", file_id, copies.len());
        Ok(DeleteReport {
            file_id,
            locations: copies,
            cache_row_removed,
            queue_entries_removed,
        })
    }

    /// Whether the file has a fresh cache row or any stored copy.
    pub async fn exists(&self, file_id: FileId) -> Result<bool> {
        if let Some(row) = self.meta.get_cache_row(file_id)?
            && row.is_fresh(self.clock.now())
        {
            return Ok(true);
        }
        Ok(self
            .backend
            .list("")
            .await?
            .iter()
            .any(|d| d.file_id == file_id && !d.is_staged()))
    }
}

fn modified_at(current: Option<&Descriptor>, cached: &Descriptor) -> DateTime<Utc> {
    current.map_or(cached.modified_at, |d| d.modified_at)
}

#[async_trait]
impl PeriodicJob for GarbageCollector {
    fn name(&self) -> &'static str {
        "garbage-collector"
    }

    async fn run_once(&self) -> Duration {
        if let Err(e) = self.run().await {
            warn!("GC run failed: {}", e);
        }
        self.config.interval()
    }

    fn deadline(&self) -> Duration {
        self.config.run_deadline()
    }

    fn abandoned(&self) -> Duration {
        ElementMetrics::inc(&self.metrics.jobs_abandoned);
        self.config.interval()
    }
}
