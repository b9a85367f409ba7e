//! Cache rebuild engine.
//!
//! The metadata cache is derived state: every row mirrors the canonical
//! descriptor of one file. Full rebuilds reconcile the whole table under
//! the exclusive rebuild lock, incremental rebuilds refresh only what
//! changed or went stale under the shared lock, and single rows are
//! refreshed lazily on read. Row writes always happen under the per-file
//! lock so they cannot interleave with a finalizer commit. The rebuild lock
//! is renewed for as long as a run lasts; a run whose lease lapses ends
//! with `LeadershipLost`.

use crate::metrics::ElementMetrics;
use crate::task::PeriodicJob;
use crate::{hold_lease, lock_file, note_contention, release_lock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durafile_common::config::RebuildConfig;
use durafile_common::{Clock, Descriptor, Error, FileId, Result};
use durafile_coord::{LockKind, LockManager, LockPriority, REBUILD_LOCK_KEY};
use durafile_meta_store::{CacheRow, MetadataStore};
use durafile_storage::{StorageBackend, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scope of a rebuild run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildMode {
    Full,
    Incremental,
}

/// Outcome of one rebuild run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub mode: RebuildMode,
    /// Canonical descriptors found on the backend
    pub scanned: usize,
    pub upserted: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Files left for the next run (per-file lock busy, or changed underneath)
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RebuildReport {
    fn new(mode: RebuildMode, now: DateTime<Utc>) -> Self {
        Self {
            mode,
            scanned: 0,
            upserted: 0,
            unchanged: 0,
            deleted: 0,
            skipped: 0,
            started_at: now,
            finished_at: now,
        }
    }

    /// Number of rows written or removed
    #[must_use]
    pub const fn deltas(&self) -> usize {
        self.upserted + self.deleted
    }
}

/// Dry-run comparison of cache and backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub consistent: usize,
    pub missing_in_cache: usize,
    pub missing_on_backend: usize,
    pub stale: usize,
    pub sample_missing_in_cache: Vec<FileId>,
    pub sample_missing_on_backend: Vec<FileId>,
    pub sample_stale: Vec<FileId>,
}

impl ConsistencyReport {
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.missing_in_cache == 0 && self.missing_on_backend == 0 && self.stale == 0
    }
}

fn push_sample(samples: &mut Vec<FileId>, file_id: FileId, limit: usize) {
    if samples.len() < limit {
        samples.push(file_id);
    }
}

/// Keeps the metadata cache in line with backend descriptors
pub struct RebuildEngine {
    backend: Arc<dyn StorageBackend>,
    meta: Arc<dyn MetadataStore>,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    config: RebuildConfig,
    metrics: Arc<ElementMetrics>,
}

impl RebuildEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        meta: Arc<dyn MetadataStore>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        config: RebuildConfig,
        metrics: Arc<ElementMetrics>,
    ) -> Self {
        Self {
            backend,
            meta,
            locks,
            clock,
            config,
            metrics,
        }
    }

    /// Reconcile every row against the backend.
    ///
    /// Fails with `LockContention` if another rebuild holds the lock.
    pub async fn full(&self) -> Result<RebuildReport> {
        let guard = self
            .locks
            .acquire(REBUILD_LOCK_KEY, LockKind::Exclusive, LockPriority::High)
            .await
            .inspect_err(|e| note_contention(&self.metrics, e))?;
        let result = hold_lease(&guard, &self.metrics, self.reconcile(RebuildMode::Full)).await;
        release_lock(guard).await;
        result
    }

    /// Refresh missing, changed and stale rows.
    pub async fn incremental(&self) -> Result<RebuildReport> {
        let guard = self
            .locks
            .acquire(REBUILD_LOCK_KEY, LockKind::Shared, LockPriority::Normal)
            .await
            .inspect_err(|e| note_contention(&self.metrics, e))?;
        let result = hold_lease(
            &guard,
            &self.metrics,
            self.reconcile(RebuildMode::Incremental),
        )
        .await;
        release_lock(guard).await;
        result
    }

    pub async fn rebuild(&self, mode: RebuildMode) -> Result<RebuildReport> {
        match mode {
            RebuildMode::Full => self.full().await,
            RebuildMode::Incremental => self.incremental().await,
        }
    }

    async fn reconcile(&self, mode: RebuildMode) -> Result<RebuildReport> {
        let now = self.clock.now();
        let mut report = RebuildReport::new(mode, now);

        let canonical = self.canonical_descriptors().await?;
        let rows: HashMap<FileId, CacheRow> = self
            .meta
            .load_cache_rows()?
            .into_iter()
            .map(|r| (r.file_id(), r))
            .collect();
        report.scanned = canonical.len();

        for (file_id, desc) in &canonical {
            let needs_refresh = match rows.get(file_id) {
                None => true,
                Some(row) => match mode {
                    RebuildMode::Full => !row.mirrors(desc) || !row.is_fresh(now),
                    RebuildMode::Incremental => {
                        desc.modified_at > row.cache_updated_at || !row.is_fresh(now)
                    }
                },
            };
            if !needs_refresh {
                report.unchanged += 1;
                continue;
            }
            match self.upsert_row(desc).await {
                Ok(true) => report.upserted += 1,
                Ok(false) => report.skipped += 1,
                Err(e) if e.is_retryable() => {
                    debug!("Deferring cache row for {}: {}", file_id, e);
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        for (file_id, row) in &rows {
            if canonical.contains_key(file_id) {
                continue;
            }
            // Incremental runs only reap rows that went stale
            if mode == RebuildMode::Incremental && row.is_fresh(now) {
                continue;
            }
            match self.delete_vanished_row(row).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => report.skipped += 1,
                Err(e) if e.is_retryable() => {
                    debug!("Deferring removal of cache row {}: {}", file_id, e);
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        report.finished_at = self.clock.now();
        match mode {
            RebuildMode::Full => ElementMetrics::inc(&self.metrics.rebuild_full_runs),
            RebuildMode::Incremental => ElementMetrics::inc(&self.metrics.rebuild_incremental_runs),
        }
        ElementMetrics::add(&self.metrics.rebuild_upserts, report.upserted as u64);
        ElementMetrics::add(&self.metrics.rebuild_deletes, report.deleted as u64);
        info!(
            "Cache rebuild ({:?}): scanned={} upserted={} deleted={} unchanged={} skipped={}",
            mode, report.scanned, report.upserted, report.deleted, report.unchanged, report.skipped
        );
        Ok(report)
    }

    /// Canonical descriptor per file: highest mode, then most recently
    /// modified. Staged copies never count.
    pub async fn canonical_descriptors(&self) -> Result<HashMap<FileId, Descriptor>> {
        let mut canonical: HashMap<FileId, Descriptor> = HashMap::new();
        for desc in self.backend.list("").await? {
            if desc.is_staged() {
                continue;
            }
            match canonical.entry(desc.file_id) {
                Entry::Occupied(mut e) => {
                    if desc.supersedes(e.get()) {
                        e.insert(desc);
                    }
                }
                Entry::Vacant(e) => {
                    e.insert(desc);
                }
            }
        }
        Ok(canonical)
    }

    /// Canonical descriptor of a single file, found by listing the backend.
    pub async fn find_canonical(&self, file_id: FileId) -> Result<Option<Descriptor>> {
        Ok(self
            .backend
            .list("")
            .await?
            .into_iter()
            .filter(|d| d.file_id == file_id && !d.is_staged())
            .reduce(|best, d| if d.supersedes(&best) { d } else { best }))
    }

    /// Write the row for `desc` if the descriptor is still on the backend.
    async fn upsert_row(&self, desc: &Descriptor) -> Result<bool> {
        let guard = lock_file(&self.locks, &self.metrics, desc.file_id).await?;
        let result = self.upsert_row_locked(desc).await;
        release_lock(guard).await;
        result
    }

    async fn upsert_row_locked(&self, desc: &Descriptor) -> Result<bool> {
        let current = match self.backend.get_descriptor(&desc.location).await {
            Ok(d) if d.file_id == desc.file_id => d,
            Ok(_) | Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        // A commit may have moved the row to a better copy since listing
        if let Some(existing) = self.meta.get_cache_row(desc.file_id)?
            && existing.location() != current.location
            && existing.descriptor.supersedes(&current)
            && self.backend.get_descriptor(existing.location()).await.is_ok()
        {
            return Ok(false);
        }
        let row = CacheRow::from_descriptor(&current, self.clock.now());
        self.meta.put_cache_row(&row)?;
        Ok(true)
    }

    /// Remove a row whose descriptor is gone, unless it reappeared.
    async fn delete_vanished_row(&self, row: &CacheRow) -> Result<bool> {
        let guard = lock_file(&self.locks, &self.metrics, row.file_id()).await?;
        let result = self.delete_vanished_row_locked(row).await;
        release_lock(guard).await;
        result
    }

    async fn delete_vanished_row_locked(&self, row: &CacheRow) -> Result<bool> {
        match self.backend.get_descriptor(row.location()).await {
            Ok(d) if d.file_id == row.file_id() => return Ok(false),
            Ok(_) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self
            .meta
            .delete_cache_row_if_location(row.file_id(), row.location())?)
    }

    /// Row for `file_id`, refreshed from the backend first if stale.
    ///
    /// Returns `None` when the cache has no row or the file is gone.
    pub async fn get_fresh(&self, file_id: FileId) -> Result<Option<CacheRow>> {
        match self.meta.get_cache_row(file_id)? {
            Some(row) if row.is_fresh(self.clock.now()) => Ok(Some(row)),
            Some(row) => self.refresh_file(file_id, Some(row.location())).await,
            None => Ok(None),
        }
    }

    /// Re-derive the row for one file from the backend.
    ///
    /// `hint` is the location to try before falling back to a listing.
    pub async fn refresh_file(
        &self,
        file_id: FileId,
        hint: Option<&str>,
    ) -> Result<Option<CacheRow>> {
        let guard = lock_file(&self.locks, &self.metrics, file_id).await?;
        let result = self.refresh_file_locked(file_id, hint).await;
        release_lock(guard).await;
        ElementMetrics::inc(&self.metrics.cache_lazy_refreshes);
        result
    }

    async fn refresh_file_locked(
        &self,
        file_id: FileId,
        hint: Option<&str>,
    ) -> Result<Option<CacheRow>> {
        let mut desc = None;
        if let Some(location) = hint {
            match self.backend.get_descriptor(location).await {
                Ok(d) if d.file_id == file_id && !d.is_staged() => desc = Some(d),
                Ok(_) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if desc.is_none() {
            desc = self.find_canonical(file_id).await?;
        }
        if let Some(d) = desc {
            let row = CacheRow::from_descriptor(&d, self.clock.now());
            self.meta.put_cache_row(&row)?;
            Ok(Some(row))
        } else {
            self.meta.delete_cache_row(file_id)?;
            Ok(None)
        }
    }

    /// Compare cache and backend without changing either.
    pub async fn consistency_check(&self) -> Result<ConsistencyReport> {
        let now = self.clock.now();
        let limit = self.config.consistency_sample_limit;
        let canonical = self.canonical_descriptors().await?;
        let rows: HashMap<FileId, CacheRow> = self
            .meta
            .load_cache_rows()?
            .into_iter()
            .map(|r| (r.file_id(), r))
            .collect();

        let mut report = ConsistencyReport::default();
        for (file_id, desc) in &canonical {
            match rows.get(file_id) {
                None => {
                    report.missing_in_cache += 1;
                    push_sample(&mut report.sample_missing_in_cache, *file_id, limit);
                }
                Some(row) if row.mirrors(desc) && row.is_fresh(now) => report.consistent += 1,
                Some(_) => {
                    report.stale += 1;
                    push_sample(&mut report.sample_stale, *file_id, limit);
                }
            }
        }
        for file_id in rows.keys() {
            if !canonical.contains_key(file_id) {
                report.missing_on_backend += 1;
                push_sample(&mut report.sample_missing_on_backend, *file_id, limit);
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for RebuildEngine {
    fn name(&self) -> &'static str {
        "cache-rebuild"
    }

    async fn run_once(&self) -> Duration {
        match self.incremental().await {
            Ok(_) => {}
            Err(Error::LockContention { .. }) => debug!("Incremental rebuild skipped: full rebuild running"),
            Err(e) => warn!("Incremental cache rebuild failed: {}", e),
        }
        self.config.incremental_interval()
    }

    fn deadline(&self) -> Duration {
        self.config.run_deadline()
    }

    fn abandoned(&self) -> Duration {
        ElementMetrics::inc(&self.metrics.jobs_abandoned);
        self.config.incremental_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::test_support::SlowBackend;
    use chrono::Duration as ChronoDuration;
    use durafile_common::StorageMode;
    use std::sync::atomic::Ordering;

    fn slow_engine(h: &Harness, steps: u32) -> RebuildEngine {
        RebuildEngine::new(
            Arc::new(SlowBackend::listing_in_steps(h, steps)),
            h.meta.clone(),
            h.locks.clone(),
            h.clock.clone(),
            h.config.rebuild.clone(),
            h.metrics.clone(),
        )
    }

    #[tokio::test]
    async fn test_full_rebuild_populates_and_is_idempotent() {
        let h = Harness::new();
        let a = h.put_file("edit/a", b"alpha", StorageMode::Edit).await;
        let b = h.put_file("ro/b", b"beta", StorageMode::ReadOnly).await;

        let first = h.rebuild.full().await.unwrap();
        assert_eq!(first.upserted, 2);
        assert_eq!(first.deleted, 0);
        let rows_after_first = h.meta.load_cache_rows().unwrap();

        let second = h.rebuild.full().await.unwrap();
        assert_eq!(second.deltas(), 0);
        assert_eq!(second.unchanged, 2);

        let mut rows_after_second = h.meta.load_cache_rows().unwrap();
        let mut rows_first = rows_after_first;
        rows_first.sort_by_key(CacheRow::file_id);
        rows_after_second.sort_by_key(CacheRow::file_id);
        assert_eq!(rows_first, rows_after_second);

        let check = h.rebuild.consistency_check().await.unwrap();
        assert!(check.is_consistent());
        assert_eq!(check.consistent, 2);

        let row_b = h.meta.get_cache_row(b.file_id).unwrap().unwrap();
        assert_eq!(row_b.ttl_hours, 168);
        let row_a = h.meta.get_cache_row(a.file_id).unwrap().unwrap();
        assert_eq!(row_a.ttl_hours, 24);
    }

    #[tokio::test]
    async fn test_full_rebuild_removes_orphan_rows_and_prefers_higher_mode() {
        let h = Harness::new();
        let edit = h.put_file("edit/doc", b"doc", StorageMode::Edit).await;
        // Same file also present as a read-only copy
        let ro = edit.relocated("ro/doc", StorageMode::ReadOnly, h.clock.now());
        h.backend
            .put("ro/doc", bytes::Bytes::from_static(b"doc"), &ro)
            .await
            .unwrap();

        let gone = h.put_file("edit/gone", b"x", StorageMode::Edit).await;
        h.rebuild.full().await.unwrap();
        h.backend.delete("edit/gone").await.unwrap();

        let report = h.rebuild.full().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(h.meta.get_cache_row(gone.file_id).unwrap().is_none());

        let row = h.meta.get_cache_row(edit.file_id).unwrap().unwrap();
        assert_eq!(row.location(), "ro/doc");
        assert_eq!(row.mode(), StorageMode::ReadOnly);
    }

    #[tokio::test]
    async fn test_staged_copies_are_never_cached() {
        let h = Harness::new();
        h.put_file(".staging/t1/f1", b"staged", StorageMode::ReadOnly).await;
        let report = h.rebuild.full().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(h.meta.cache_row_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incremental_refreshes_changed_and_stale_rows() {
        let h = Harness::new();
        let a = h.put_file("edit/a", b"one", StorageMode::Edit).await;
        h.rebuild.full().await.unwrap();

        // Descriptor rewritten after the row was cached
        h.clock.advance(ChronoDuration::minutes(5));
        let mut changed = a.clone();
        changed.checksum = durafile_common::Checksum::compute_full(b"two");
        changed.modified_at = h.clock.now();
        h.backend
            .put("edit/a", bytes::Bytes::from_static(b"two"), &changed)
            .await
            .unwrap();

        let report = h.rebuild.incremental().await.unwrap();
        assert_eq!(report.upserted, 1);
        let row = h.meta.get_cache_row(a.file_id).unwrap().unwrap();
        assert_eq!(row.descriptor.modified_at, changed.modified_at);

        // Nothing changed and nothing stale
        assert_eq!(h.rebuild.incremental().await.unwrap().deltas(), 0);

        // Stale after the 24h mutable TTL
        h.clock.advance(ChronoDuration::hours(25));
        assert_eq!(h.rebuild.incremental().await.unwrap().upserted, 1);
    }

    #[tokio::test]
    async fn test_incremental_keeps_fresh_rows_without_descriptor() {
        let h = Harness::new();
        let a = h.put_file("edit/a", b"one", StorageMode::Edit).await;
        h.rebuild.full().await.unwrap();
        h.backend.delete("edit/a").await.unwrap();

        assert_eq!(h.rebuild.incremental().await.unwrap().deleted, 0);
        h.clock.advance(ChronoDuration::hours(25));
        assert_eq!(h.rebuild.incremental().await.unwrap().deleted, 1);
        assert!(h.meta.get_cache_row(a.file_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_fresh_refreshes_stale_row() {
        let h = Harness::new();
        let a = h.put_file("edit/a", b"one", StorageMode::Edit).await;
        h.rebuild.full().await.unwrap();
        let cached_at = h.meta.get_cache_row(a.file_id).unwrap().unwrap().cache_updated_at;

        h.clock.advance(ChronoDuration::hours(30));
        let row = h.rebuild.get_fresh(a.file_id).await.unwrap().unwrap();
        assert!(row.cache_updated_at > cached_at);
        assert!(row.is_fresh(h.clock.now()));

        h.backend.delete("edit/a").await.unwrap();
        h.clock.advance(ChronoDuration::hours(30));
        assert!(h.rebuild.get_fresh(a.file_id).await.unwrap().is_none());
        assert!(h.meta.get_cache_row(a.file_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consistency_check_never_mutates() {
        let h = Harness::new();
        let a = h.put_file("edit/a", b"one", StorageMode::Edit).await;
        let report = h.rebuild.consistency_check().await.unwrap();
        assert_eq!(report.missing_in_cache, 1);
        assert_eq!(report.sample_missing_in_cache, vec![a.file_id]);
        assert_eq!(h.meta.cache_row_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_rebuild_busy_while_another_runs() {
        let h = Harness::new();
        let guard = h
            .locks
            .acquire(REBUILD_LOCK_KEY, LockKind::Shared, LockPriority::Normal)
            .await
            .unwrap();
        let err = h.rebuild.full().await.unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
        guard.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_full_rebuild_keeps_exclusive_lock() {
        let h = Harness::new();
        h.put_file("edit/a", b"alpha", StorageMode::Edit).await;
        let other = h.replica("replica-2");
        let engine = slow_engine(&h, 6);

        // The scan outlives the 30s lock TTL several times over
        let (report, refused) = tokio::join!(engine.full(), async {
            let mut refused = 0;
            for wait in [35, 13] {
                tokio::time::sleep(Duration::from_secs(wait)).await;
                let shared = other
                    .locks
                    .acquire(REBUILD_LOCK_KEY, LockKind::Shared, LockPriority::Normal)
                    .await;
                if matches!(shared, Err(Error::LockContention { .. })) {
                    refused += 1;
                }
            }
            refused
        });
        assert_eq!(refused, 2);
        assert_eq!(report.unwrap().upserted, 1);

        // Released at the end of the run
        let shared = other
            .locks
            .acquire(REBUILD_LOCK_KEY, LockKind::Shared, LockPriority::Normal)
            .await
            .unwrap();
        shared.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_ends_early_when_lock_lapses() {
        let h = Harness::new();
        h.put_file("edit/a", b"alpha", StorageMode::Edit).await;
        let engine = slow_engine(&h, 4);

        // Stall the coordination clock past the TTL before the first renewal
        let (report, ()) = tokio::join!(engine.full(), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            h.clock.advance(ChronoDuration::seconds(31));
        });
        assert!(matches!(report, Err(Error::LeadershipLost { .. })));
        assert_eq!(h.metrics.lock_leases_lost.load(Ordering::Relaxed), 1);
        assert_eq!(h.meta.cache_row_count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_renewal_failure_is_retried() {
        let h = Harness::new();
        h.put_file("edit/a", b"alpha", StorageMode::Edit).await;
        let engine = slow_engine(&h, 4);

        let (report, ()) = tokio::join!(engine.full(), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            h.coord.fail_next(1);
        });
        assert_eq!(report.unwrap().upserted, 1);
        assert_eq!(h.metrics.lock_leases_lost.load(Ordering::Relaxed), 0);
    }
}
