//! Storage element facade.
//!
//! Wires the lifecycle components over one backend, metadata store and
//! coordination store, and exposes the caller-facing operations. Every
//! operation checks the caller context against the roles it admits;
//! authentication itself happens upstream.

use crate::capacity::{CapacityMonitor, CapacitySnapshot};
use crate::finalizer::{CommitOutcome, Finalizer, RecoveryReport};
use crate::gc::{DeleteReport, GarbageCollector, GcReport};
use crate::metrics::ElementMetrics;
use crate::rebuild::{ConsistencyReport, RebuildEngine, RebuildMode, RebuildReport};
use crate::task::PeriodicTask;
use crate::{lock_file, release_lock};
use bytes::Bytes;
use durafile_common::{
    CallerContext, Checksum, Clock, Config, Descriptor, Error, FileId, Result, Role, StorageMode,
    TransactionId, is_staging_location,
};
use durafile_coord::{CoordinationStore, LockManager};
use durafile_meta_store::{CacheRow, FinalizeTransaction, MetadataStore};
use durafile_storage::{StorageBackend, StorageError, validate_location};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const WRITE_ROLES: &[Role] = &[Role::ServiceAccount, Role::Admin];
const MAINTENANCE_ROLES: &[Role] = &[Role::Admin, Role::Operator];
const READ_ROLES: &[Role] = &[Role::ServiceAccount, Role::Admin, Role::Operator];

/// New mutable file handed over by the ingest tier
#[derive(Clone, Debug)]
pub struct IngestRequest {
    /// Logical (user-facing) name
    pub name: String,
    pub location: String,
    pub data: Bytes,
}

/// One storage element replica
pub struct StorageElement {
    element_id: String,
    config: Config,
    backend: Arc<dyn StorageBackend>,
    meta: Arc<dyn MetadataStore>,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ElementMetrics>,
    finalizer: Arc<Finalizer>,
    rebuild: Arc<RebuildEngine>,
    gc: Arc<GarbageCollector>,
    capacity: Arc<CapacityMonitor>,
}

impl StorageElement {
    pub fn new(
        config: Config,
        backend: Arc<dyn StorageBackend>,
        meta: Arc<dyn MetadataStore>,
        coordination: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(ElementMetrics::new());
        let locks = Arc::new(LockManager::new(
            coordination,
            config.node.replica_id.clone(),
            &config.coordination,
        ));

        let finalizer = Arc::new(Finalizer::new(
            backend.clone(),
            meta.clone(),
            locks.clone(),
            clock.clone(),
            config.finalizer.clone(),
            metrics.clone(),
        ));
        let rebuild = Arc::new(RebuildEngine::new(
            backend.clone(),
            meta.clone(),
            locks.clone(),
            clock.clone(),
            config.rebuild.clone(),
            metrics.clone(),
        ));
        let gc = Arc::new(GarbageCollector::new(
            backend.clone(),
            meta.clone(),
            locks.clone(),
            clock.clone(),
            config.gc.clone(),
            config.finalizer.safety_margin(),
            metrics.clone(),
        ));
        let capacity = Arc::new(CapacityMonitor::new(
            backend.clone(),
            locks.clone(),
            clock.clone(),
            &config.node,
            config.capacity.clone(),
            metrics.clone(),
        ));

        info!(
            "Storage element {} (replica {}) on {} backend",
            config.node.element_id,
            config.node.replica_id,
            backend.name()
        );
        Ok(Self {
            element_id: config.node.element_id.clone(),
            config,
            backend,
            meta,
            locks,
            clock,
            metrics,
            finalizer,
            rebuild,
            gc,
            capacity,
        })
    }

    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    pub fn metrics(&self) -> &Arc<ElementMetrics> {
        &self.metrics
    }

    pub fn finalizer(&self) -> &Arc<Finalizer> {
        &self.finalizer
    }

    pub fn rebuild_engine(&self) -> &Arc<RebuildEngine> {
        &self.rebuild
    }

    pub fn garbage_collector(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn capacity_monitor(&self) -> &Arc<CapacityMonitor> {
        &self.capacity
    }

    /// Spawn the recovery sweep, incremental rebuild, GC and capacity loops.
    pub fn spawn_background(&self) -> Vec<PeriodicTask> {
        vec![
            PeriodicTask::spawn(self.capacity.clone(), Duration::ZERO),
            PeriodicTask::spawn(self.finalizer.clone(), self.config.finalizer.sweep_interval()),
            PeriodicTask::spawn(self.rebuild.clone(), self.config.rebuild.incremental_interval()),
            PeriodicTask::spawn(self.gc.clone(), self.config.gc.interval()),
        ]
    }

    /// Stop background loops and hand capacity leadership to another replica.
    pub async fn shutdown(&self, tasks: Vec<PeriodicTask>) {
        for task in tasks {
            task.shutdown().await;
        }
        self.capacity.step_down().await;
    }

    // ---- Ingest and read path ----

    /// Store a new `EDIT` file and its cache row.
    pub async fn ingest(&self, ctx: &CallerContext, req: IngestRequest) -> Result<Descriptor> {
        ctx.require(WRITE_ROLES, "ingest")?;
        validate_location(&req.location)?;
        if is_staging_location(&req.location) {
            return Err(Error::invalid_argument(format!(
                "{} is inside the staging area",
                req.location
            )));
        }
        match self.backend.get_descriptor(&req.location).await {
            Ok(_) => {
                return Err(Error::invalid_argument(format!(
                    "{} already exists",
                    req.location
                )));
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let now = self.clock.now();
        let desc = Descriptor {
            file_id: FileId::new(),
            name: req.name,
            location: req.location,
            size: req.data.len() as u64,
            checksum: Checksum::compute_full(&req.data),
            mode: StorageMode::Edit,
            owner: ctx.subject.clone(),
            created_at: now,
            modified_at: now,
        };

        let guard = lock_file(&self.locks, &self.metrics, desc.file_id).await?;
        let result = self.ingest_locked(&desc, req.data).await;
        release_lock(guard).await;
        result?;
        info!("Ingested {} as {} ({} bytes)", desc.location, desc.file_id, desc.size);
        Ok(desc)
    }

    async fn ingest_locked(&self, desc: &Descriptor, data: Bytes) -> Result<()> {
        self.backend.put(&desc.location, data, desc).await?;
        self.meta
            .put_cache_row(&CacheRow::from_descriptor(desc, self.clock.now()))?;
        Ok(())
    }

    /// Cache row of a file, refreshed from the backend when stale or missing.
    pub async fn file_metadata(&self, ctx: &CallerContext, file_id: FileId) -> Result<CacheRow> {
        ctx.require(READ_ROLES, "file.metadata")?;
        if let Some(row) = self.rebuild.get_fresh(file_id).await? {
            return Ok(row);
        }
        self.rebuild
            .refresh_file(file_id, None)
            .await?
            .ok_or_else(|| Error::not_found(format!("file {file_id}")))
    }

    // ---- Finalization ----

    pub async fn finalize_prepare(
        &self,
        ctx: &CallerContext,
        file_id: FileId,
        source_location: &str,
        target_location: &str,
        target_mode: StorageMode,
    ) -> Result<FinalizeTransaction> {
        ctx.require(WRITE_ROLES, "finalize.prepare")?;
        self.finalizer
            .prepare(file_id, source_location, target_location, target_mode)
            .await
    }

    pub async fn finalize_commit(
        &self,
        ctx: &CallerContext,
        txn_id: TransactionId,
    ) -> Result<CommitOutcome> {
        ctx.require(WRITE_ROLES, "finalize.commit")?;
        self.finalizer.commit(txn_id).await
    }

    pub async fn finalize_abort(
        &self,
        ctx: &CallerContext,
        txn_id: TransactionId,
    ) -> Result<FinalizeTransaction> {
        ctx.require(WRITE_ROLES, "finalize.abort")?;
        self.finalizer.abort(txn_id).await
    }

    pub fn finalize_status(
        &self,
        ctx: &CallerContext,
        txn_id: TransactionId,
    ) -> Result<FinalizeTransaction> {
        ctx.require(READ_ROLES, "finalize.status")?;
        self.finalizer.transaction(txn_id)
    }

    /// Run the recovery sweep now instead of waiting for the timer.
    pub async fn finalize_recover(&self, ctx: &CallerContext) -> Result<RecoveryReport> {
        ctx.require(MAINTENANCE_ROLES, "finalize.recover")?;
        self.finalizer.recover().await
    }

    // ---- Cache ----

    pub async fn cache_rebuild(
        &self,
        ctx: &CallerContext,
        mode: RebuildMode,
    ) -> Result<RebuildReport> {
        ctx.require(MAINTENANCE_ROLES, "cache.rebuild")?;
        self.rebuild.rebuild(mode).await
    }

    /// Dry run; never mutates the cache.
    pub async fn cache_consistency_check(&self, ctx: &CallerContext) -> Result<ConsistencyReport> {
        ctx.require(MAINTENANCE_ROLES, "cache.consistencyCheck")?;
        self.rebuild.consistency_check().await
    }

    // ---- Garbage collection ----

    pub async fn gc_run_once(&self, ctx: &CallerContext) -> Result<GcReport> {
        ctx.require(MAINTENANCE_ROLES, "gc.runOnce")?;
        self.gc.run().await
    }

    pub async fn gc_delete(&self, ctx: &CallerContext, file_id: FileId) -> Result<DeleteReport> {
        ctx.require(MAINTENANCE_ROLES, "gc.delete")?;
        self.gc.delete(file_id).await
    }

    pub async fn gc_exists(&self, ctx: &CallerContext, file_id: FileId) -> Result<bool> {
        ctx.require(READ_ROLES, "gc.exists")?;
        if self.rebuild.get_fresh(file_id).await?.is_some() {
            return Ok(true);
        }
        self.gc.exists(file_id).await
    }

    // ---- Capacity ----

    pub async fn capacity_current(&self, ctx: &CallerContext) -> Result<CapacitySnapshot> {
        ctx.require(READ_ROLES, "capacity.current")?;
        self.capacity.current().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durafile_common::ManualClock;
    use durafile_coord::MemoryCoordinationStore;
    use durafile_meta_store::MetaStore;
    use durafile_storage::MemoryBackend;

    fn element() -> StorageElement {
        let clock = Arc::new(ManualClock::starting_now());
        StorageElement::new(
            Config::default(),
            Arc::new(MemoryBackend::with_clock(1024 * 1024, clock.clone())),
            Arc::new(MetaStore::open_in_memory().unwrap()),
            Arc::new(MemoryCoordinationStore::with_clock(clock.clone())),
            clock,
        )
        .unwrap()
    }

    fn ingest_request(location: &str) -> IngestRequest {
        IngestRequest {
            name: "scan.pdf".into(),
            location: location.into(),
            data: Bytes::from_static(b"%PDF-1.7"),
        }
    }

    #[tokio::test]
    async fn test_roles_are_enforced() {
        let se = element();
        let operator = CallerContext::new("ops-1", Role::Operator);
        let service = CallerContext::new("svc-ingest", Role::ServiceAccount);

        let err = se
            .ingest(&operator, ingest_request("edit/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));

        let err = se.gc_run_once(&service).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));

        let mut expired = CallerContext::new("admin", Role::Admin);
        expired.token_valid = false;
        let err = se.capacity_current(&expired).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_ingest_and_read_back() {
        let se = element();
        let service = CallerContext::new("svc-ingest", Role::ServiceAccount);

        let desc = se.ingest(&service, ingest_request("edit/a")).await.unwrap();
        assert_eq!(desc.owner, "svc-ingest");
        assert_eq!(desc.mode, StorageMode::Edit);

        let row = se.file_metadata(&service, desc.file_id).await.unwrap();
        assert_eq!(row.descriptor, desc);
        assert_eq!(row.ttl_hours, 24);
        assert!(se.gc_exists(&service, desc.file_id).await.unwrap());

        let err = se
            .ingest(&service, ingest_request("edit/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = se
            .ingest(&service, ingest_request(".staging/x/y"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_file_metadata_recovers_missing_row() {
        let se = element();
        let service = CallerContext::new("svc-ingest", Role::ServiceAccount);
        let desc = se.ingest(&service, ingest_request("edit/a")).await.unwrap();
        se.meta.delete_cache_row(desc.file_id).unwrap();

        let row = se.file_metadata(&service, desc.file_id).await.unwrap();
        assert_eq!(row.location(), "edit/a");

        let err = se.file_metadata(&service, FileId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_start_and_stop() {
        let se = element();
        let tasks = se.spawn_background();
        assert_eq!(tasks.len(), 4);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(se.capacity_monitor().is_leader().await);

        se.shutdown(tasks).await;
        assert!(!se.capacity_monitor().is_leader().await);
    }
}
