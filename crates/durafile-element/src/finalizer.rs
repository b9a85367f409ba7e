//! Two-phase finalizer.
//!
//! Moves a mutable (`EDIT`) file to an immutable mode in two steps:
//!
//! 1. `prepare` records an `INITIATED` transaction, stages a copy of the
//!    source under `.staging/<txn>/<file>`, records its checksum and moves
//!    the transaction to `PREPARED`.
//! 2. `commit` re-verifies the staged bytes, writes the target copy, points
//!    the cache row at it, drops the staged copy and marks `COMMITTED`.
//!
//! The source copy is left in place; the garbage collector reclaims it once
//! the safety margin after `committed_at` has passed. Finalization happens
//! once per file: a file with a committed transaction, or whose cached copy
//! is already `RO`/`AR`, cannot be prepared again. Commit and abort run
//! under the per-file lock. A recovery sweep re-drives transactions stuck in
//! `PREPARED` and gives up on them (`FAILED`) after a bounded number of
//! attempts, leaving them for an operator.

use crate::metrics::ElementMetrics;
use crate::task::PeriodicJob;
use crate::{lock_file, release_lock};
use async_trait::async_trait;
use durafile_common::clock::to_chrono;
use durafile_common::config::FinalizerConfig;
use durafile_common::{
    Checksum, Clock, Descriptor, Error, FileId, Result, StorageMode, TransactionId,
    is_staging_location, staged_location,
};
use durafile_coord::LockManager;
use durafile_meta_store::{CacheRow, FinalizeTransaction, MetadataStore, TransactionStatus};
use durafile_storage::{StorageBackend, StorageError, validate_location};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Result of a commit request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub txn_id: TransactionId,
    pub file_id: FileId,
    pub target_location: String,
    pub target_mode: StorageMode,
    pub checksum: Option<Checksum>,
    pub attempts: u32,
    /// The transaction was already committed before this request
    pub already_committed: bool,
}

impl CommitOutcome {
    fn from_txn(txn: &FinalizeTransaction, already_committed: bool) -> Self {
        Self {
            txn_id: txn.txn_id,
            file_id: txn.file_id,
            target_location: txn.target_location.clone(),
            target_mode: txn.target_mode,
            checksum: txn.staged_checksum.clone(),
            attempts: txn.attempts,
            already_committed,
        }
    }
}

/// Outcome of one recovery sweep
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Transactions past the prepare timeout
    pub scanned: usize,
    pub recommitted: usize,
    pub failed: usize,
    pub aborted: usize,
    /// Left for the next sweep (lock busy or transient error)
    pub deferred: usize,
}

/// Two-phase finalize coordinator
pub struct Finalizer {
    backend: Arc<dyn StorageBackend>,
    meta: Arc<dyn MetadataStore>,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    config: FinalizerConfig,
    metrics: Arc<ElementMetrics>,
}

impl Finalizer {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        meta: Arc<dyn MetadataStore>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        config: FinalizerConfig,
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

    pub fn transaction(&self, txn_id: TransactionId) -> Result<FinalizeTransaction> {
        self.meta
            .get_txn(txn_id)?
            .ok_or_else(|| Error::not_found(format!("transaction {txn_id}")))
    }

    /// Stage the source copy of `file_id` for finalization into `target_mode`.
    pub async fn prepare(
        &self,
        file_id: FileId,
        source_location: &str,
        target_location: &str,
        target_mode: StorageMode,
    ) -> Result<FinalizeTransaction> {
        if target_mode.is_mutable() {
            return Err(Error::invalid_argument(
                "finalization target mode must be RO or AR",
            ));
        }
        validate_location(target_location)?;
        if is_staging_location(target_location) {
            return Err(Error::invalid_argument(format!(
                "target {target_location} is inside the staging area"
            )));
        }
        if source_location == target_location {
            return Err(Error::invalid_argument(
                "source and target locations must differ",
            ));
        }

        let guard = lock_file(&self.locks, &self.metrics, file_id).await?;
        let result = self
            .prepare_locked(file_id, source_location, target_location, target_mode)
            .await;
        release_lock(guard).await;
        result
    }

    async fn prepare_locked(
        &self,
        file_id: FileId,
        source_location: &str,
        target_location: &str,
        target_mode: StorageMode,
    ) -> Result<FinalizeTransaction> {
        let history = self.meta.txns_for_file(file_id)?;
        if let Some(open) = history.iter().find(|t| t.status.is_in_flight()) {
            return Err(Error::InFlight {
                file_id,
                txn_id: open.txn_id,
            });
        }
        if let Some(done) = history
            .iter()
            .find(|t| t.status == TransactionStatus::Committed)
        {
            return Err(Error::invalid_argument(format!(
                "file {file_id} was already finalized to {} by transaction {}",
                done.target_location, done.txn_id
            )));
        }
        if let Some(row) = self.meta.get_cache_row(file_id)?
            && !row.mode().is_mutable()
        {
            return Err(Error::invalid_argument(format!(
                "file {file_id} is already {} at {}",
                row.mode(),
                row.location()
            )));
        }

        let (data, source) = self.backend.get(source_location).await?;
        if source.file_id != file_id {
            return Err(Error::ConsistencyViolation {
                file_id,
                detail: format!("{source_location} holds file {}", source.file_id),
            });
        }
        if source.mode != StorageMode::Edit {
            return Err(Error::invalid_argument(format!(
                "source copy of {file_id} is {}, expected EDIT",
                source.mode
            )));
        }
        if !source.checksum.verify_full(&data) {
            return Err(Error::ConsistencyViolation {
                file_id,
                detail: format!("bytes at {source_location} do not match their descriptor"),
            });
        }
        match self.backend.get_descriptor(target_location).await {
            Ok(_) => {
                return Err(Error::invalid_argument(format!(
                    "target {target_location} already exists"
                )));
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let now = self.clock.now();
        let txn_id = TransactionId::new();
        let staged = staged_location(txn_id, file_id);
        let mut txn = FinalizeTransaction::initiated(
            txn_id,
            file_id,
            source_location,
            staged.as_str(),
            target_location,
            target_mode,
            now,
        );
        self.meta.put_txn(&txn)?;

        let staged_desc = source.relocated(staged.as_str(), target_mode, now);
        if let Err(e) = self.backend.put(&staged, data.clone(), &staged_desc).await {
            warn!("Staging {} for transaction {} failed: {}", file_id, txn_id, e);
            self.roll_back_unstaged(&mut txn, &e.to_string()).await;
            return Err(e.into());
        }

        txn.staged_checksum = Some(Checksum::compute_full(&data));
        txn.transition(TransactionStatus::Prepared, self.clock.now())?;
        self.meta.put_txn(&txn)?;

        ElementMetrics::inc(&self.metrics.finalize_prepared);
        info!(
            "Prepared transaction {} for file {}: {} -> {} ({})",
            txn_id, file_id, source_location, target_location, target_mode
        );
        Ok(txn)
    }

    async fn roll_back_unstaged(&self, txn: &mut FinalizeTransaction, reason: &str) {
        if let Err(e) = self.backend.delete_if_exists(&txn.staged_location).await {
            warn!("Failed to remove partial staged copy {}: {}", txn.staged_location, e);
        }
        txn.last_error = Some(reason.to_string());
        let persisted = txn
            .transition(TransactionStatus::RolledBack, self.clock.now())
            .and_then(|()| self.meta.put_txn(txn).map_err(Error::from));
        if let Err(e) = persisted {
            // Left INITIATED; the recovery sweep aborts it after the timeout
            warn!("Failed to record rollback of {}: {}", txn.txn_id, e);
        }
    }

    /// Commit a prepared transaction. Committing twice is a no-op.
    pub async fn commit(&self, txn_id: TransactionId) -> Result<CommitOutcome> {
        let txn = self.transaction(txn_id)?;
        if txn.status == TransactionStatus::Committed {
            return Ok(CommitOutcome::from_txn(&txn, true));
        }

        let guard = lock_file(&self.locks, &self.metrics, txn.file_id).await?;
        let result = self.commit_locked(txn_id).await;
        release_lock(guard).await;
        result
    }

    async fn commit_locked(&self, txn_id: TransactionId) -> Result<CommitOutcome> {
        // Re-read under the lock; another replica may have finished it
        let mut txn = self.transaction(txn_id)?;
        match txn.status {
            TransactionStatus::Committed => return Ok(CommitOutcome::from_txn(&txn, true)),
            TransactionStatus::Prepared => {}
            other => {
                return Err(Error::InvalidTransition {
                    txn_id,
                    from: other.to_string(),
                    to: TransactionStatus::Committed.to_string(),
                });
            }
        }
        let Some(expected) = txn.staged_checksum.clone() else {
            let e = Error::ConsistencyViolation {
                file_id: txn.file_id,
                detail: "no staged checksum recorded".into(),
            };
            self.mark_failed(&mut txn, &e.to_string())?;
            return Err(e);
        };

        txn.attempts += 1;
        match self.apply_commit(&txn, &expected).await {
            Ok(target) => {
                let now = self.clock.now();
                txn.last_error = None;
                txn.transition(TransactionStatus::Committed, now)?;
                let row = CacheRow::from_descriptor(&target, now);
                self.meta.put_txn_and_cache_row(&txn, &row)?;

                ElementMetrics::inc(&self.metrics.finalize_committed);
                info!(
                    "Committed transaction {}: file {} is {} at {}",
                    txn_id, txn.file_id, txn.target_mode, txn.target_location
                );
                Ok(CommitOutcome::from_txn(&txn, false))
            }
            Err(e @ Error::ConsistencyViolation { .. }) => {
                self.mark_failed(&mut txn, &e.to_string())?;
                Err(e)
            }
            Err(e) => {
                txn.last_error = Some(e.to_string());
                if txn.attempts >= self.config.max_commit_attempts {
                    self.mark_failed(&mut txn, &e.to_string())?;
                    return Err(Error::PartialCommitFailure {
                        txn_id,
                        file_id: txn.file_id,
                        attempts: txn.attempts,
                    });
                }
                self.meta.put_txn(&txn)?;
                warn!(
                    "Commit attempt {} of transaction {} failed: {}",
                    txn.attempts, txn_id, e
                );
                Err(e)
            }
        }
    }

    /// Write the target copy and drop the staged one. Returns the target descriptor.
    async fn apply_commit(
        &self,
        txn: &FinalizeTransaction,
        expected: &Checksum,
    ) -> Result<Descriptor> {
        let target = match self.backend.get(&txn.staged_location).await {
            Ok((data, staged)) => {
                if !expected.verify_full(&data) {
                    return Err(Error::ConsistencyViolation {
                        file_id: txn.file_id,
                        detail: "staged artifact changed since prepare".into(),
                    });
                }
                let desc =
                    staged.relocated(txn.target_location.as_str(), txn.target_mode, self.clock.now());
                self.backend.put(&txn.target_location, data, &desc).await?;
                desc
            }
            Err(StorageError::NotFound(_)) => {
                // Interrupted after the target was written: finish from it
                match self.backend.get(&txn.target_location).await {
                    Ok((data, desc))
                        if desc.file_id == txn.file_id
                            && desc.mode == txn.target_mode
                            && expected.verify_full(&data) =>
                    {
                        desc
                    }
                    Ok(_) | Err(StorageError::NotFound(_)) => {
                        return Err(Error::ConsistencyViolation {
                            file_id: txn.file_id,
                            detail: "staged artifact missing and no verified target copy".into(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.backend.delete_if_exists(&txn.staged_location).await?;
        Ok(target)
    }

    fn mark_failed(&self, txn: &mut FinalizeTransaction, reason: &str) -> Result<()> {
        txn.last_error = Some(reason.to_string());
        txn.transition(TransactionStatus::Failed, self.clock.now())?;
        self.meta.put_txn(txn)?;
        ElementMetrics::inc(&self.metrics.finalize_failed);
        error!(
            "Finalize transaction {} for file {} FAILED after {} attempts: {}",
            txn.txn_id, txn.file_id, txn.attempts, reason
        );
        Ok(())
    }

    /// Roll back an `INITIATED` or `PREPARED` transaction.
    pub async fn abort(&self, txn_id: TransactionId) -> Result<FinalizeTransaction> {
        let txn = self.transaction(txn_id)?;
        let guard = lock_file(&self.locks, &self.metrics, txn.file_id).await?;
        let result = self.abort_locked(txn_id).await;
        release_lock(guard).await;
        result
    }

    async fn abort_locked(&self, txn_id: TransactionId) -> Result<FinalizeTransaction> {
        let mut txn = self.transaction(txn_id)?;
        if !txn.status.is_in_flight() {
            return Err(Error::InvalidTransition {
                txn_id,
                from: txn.status.to_string(),
                to: TransactionStatus::RolledBack.to_string(),
            });
        }

        self.backend.delete_if_exists(&txn.staged_location).await?;
        // Prepare refuses an existing target, so a matching copy there is ours
        if let Some(expected) = &txn.staged_checksum {
            match self.backend.get(&txn.target_location).await {
                Ok((data, desc)) if desc.file_id == txn.file_id && expected.verify_full(&data) => {
                    self.backend.delete_if_exists(&txn.target_location).await?;
                }
                Ok(_) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        txn.transition(TransactionStatus::RolledBack, self.clock.now())?;
        self.meta.put_txn(&txn)?;
        ElementMetrics::inc(&self.metrics.finalize_aborted);
        info!("Rolled back transaction {} for file {}", txn_id, txn.file_id);
        Ok(txn)
    }

    /// Re-drive transactions stuck past the prepare timeout.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let now = self.clock.now();
        let timeout = to_chrono(self.config.prepare_timeout());
        let mut report = RecoveryReport::default();

        for txn in self.meta.load_txns()? {
            match txn.status {
                TransactionStatus::Prepared => {
                    let since = txn.prepared_at.unwrap_or(txn.updated_at);
                    if now - since < timeout {
                        continue;
                    }
                    report.scanned += 1;
                    match self.recover_prepared(txn.txn_id, txn.file_id).await {
                        Ok(TransactionStatus::Committed) => report.recommitted += 1,
                        Ok(TransactionStatus::Failed) => report.failed += 1,
                        Ok(_) => report.deferred += 1,
                        Err(e) => {
                            warn!("Recovery of transaction {} deferred: {}", txn.txn_id, e);
                            report.deferred += 1;
                        }
                    }
                }
                TransactionStatus::Initiated => {
                    if now - txn.created_at < timeout {
                        continue;
                    }
                    report.scanned += 1;
                    match self.abort(txn.txn_id).await {
                        Ok(_) => report.aborted += 1,
                        Err(e) => {
                            warn!("Abort of stale transaction {} deferred: {}", txn.txn_id, e);
                            report.deferred += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if report.scanned > 0 {
            info!(
                "Finalize recovery: scanned={} recommitted={} failed={} aborted={} deferred={}",
                report.scanned, report.recommitted, report.failed, report.aborted, report.deferred
            );
        }
        Ok(report)
    }

    /// Returns the status the transaction ended up in.
    async fn recover_prepared(
        &self,
        txn_id: TransactionId,
        file_id: FileId,
    ) -> Result<TransactionStatus> {
        let guard = lock_file(&self.locks, &self.metrics, file_id).await?;
        let result = self.recover_prepared_locked(txn_id).await;
        release_lock(guard).await;
        result
    }

    async fn recover_prepared_locked(&self, txn_id: TransactionId) -> Result<TransactionStatus> {
        let mut txn = self.transaction(txn_id)?;
        if txn.status != TransactionStatus::Prepared {
            return Ok(txn.status);
        }
        if txn.attempts >= self.config.max_commit_attempts {
            self.mark_failed(&mut txn, "commit attempts exhausted")?;
            return Ok(TransactionStatus::Failed);
        }
        match self.commit_locked(txn_id).await {
            Ok(_) => {
                ElementMetrics::inc(&self.metrics.finalize_recovered);
                Ok(TransactionStatus::Committed)
            }
            Err(e) => {
                let status = self.transaction(txn_id)?.status;
                if status == TransactionStatus::Failed {
                    Ok(status)
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[async_trait]
impl PeriodicJob for Finalizer {
    fn name(&self) -> &'static str {
        "finalize-recovery"
    }

    async fn run_once(&self) -> Duration {
        if let Err(e) = self.recover().await {
            warn!("Finalize recovery sweep failed: {}", e);
        }
        self.config.sweep_interval()
    }

    fn deadline(&self) -> Duration {
        self.config.sweep_deadline()
    }

    fn abandoned(&self) -> Duration {
        ElementMetrics::inc(&self.metrics.jobs_abandoned);
        self.config.sweep_interval()
    }
}
