//! End-to-end lifecycle scenarios across finalizer, cache, GC and capacity.

use bytes::Bytes;
use chrono::Duration as ChronoDuration;
use durafile_common::{
    CallerContext, Clock, Config, Error, FileId, ManualClock, Role, StorageMode,
};
use durafile_coord::MemoryCoordinationStore;
use durafile_element::{IngestRequest, RebuildMode, ReplicaRole, StorageElement};
use durafile_meta_store::{MetaStore, MetadataStore, TransactionStatus};
use durafile_storage::{FilesystemBackend, MemoryBackend, StorageBackend};
use std::sync::Arc;

/// Replicas of one storage element: backend, metadata store and
/// coordination store are shared by every replica
struct Cluster {
    clock: Arc<ManualClock>,
    backend: Arc<dyn StorageBackend>,
    meta: Arc<dyn MetadataStore>,
    coord: Arc<MemoryCoordinationStore>,
}

impl Cluster {
    fn in_memory() -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        Self {
            backend: Arc::new(MemoryBackend::with_clock(64 * 1024 * 1024, clock.clone())),
            meta: Arc::new(MetaStore::open_in_memory().unwrap()),
            coord: Arc::new(MemoryCoordinationStore::with_clock(clock.clone())),
            clock,
        }
    }

    fn replica(&self, replica_id: &str) -> StorageElement {
        self.replica_with_meta(replica_id, self.meta.clone())
    }

    /// A replica over a different metadata store, e.g. one that lost its cache
    fn replica_with_meta(&self, replica_id: &str, meta: Arc<dyn MetadataStore>) -> StorageElement {
        let mut config = Config::default();
        config.node.replica_id = replica_id.to_string();
        StorageElement::new(
            config,
            self.backend.clone(),
            meta,
            self.coord.clone(),
            self.clock.clone(),
        )
        .unwrap()
    }

    fn element(&self) -> StorageElement {
        self.replica("replica-1")
    }
}

fn service() -> CallerContext {
    CallerContext::new("svc-ingest", Role::ServiceAccount)
}

fn operator() -> CallerContext {
    CallerContext::new("ops-1", Role::Operator)
}

fn upload(location: &str, body: &'static [u8]) -> IngestRequest {
    IngestRequest {
        name: format!("{location}.pdf"),
        location: location.to_string(),
        data: Bytes::from_static(body),
    }
}

#[tokio::test]
async fn test_finalize_then_reclaim_source_after_safety_margin() {
    let cluster = Cluster::in_memory();
    let se = cluster.element();

    let desc = se
        .ingest(&service(), upload("edit/contract", b"signed contract"))
        .await
        .unwrap();
    let txn = se
        .finalize_prepare(
            &service(),
            desc.file_id,
            "edit/contract",
            "ro/contract",
            StorageMode::ReadOnly,
        )
        .await
        .unwrap();
    let outcome = se.finalize_commit(&service(), txn.txn_id).await.unwrap();

    let row = se.file_metadata(&service(), desc.file_id).await.unwrap();
    assert_eq!(row.mode(), StorageMode::ReadOnly);
    assert_eq!(row.location(), "ro/contract");
    assert_eq!(row.ttl_hours, 168);
    assert_eq!(Some(row.descriptor.checksum), outcome.checksum);

    cluster.clock.advance(ChronoDuration::hours(23));
    let report = se.gc_run_once(&operator()).await.unwrap();
    assert_eq!(report.deleted(), 0);
    assert!(cluster.backend.get_descriptor("edit/contract").await.is_ok());

    cluster.clock.advance(ChronoDuration::hours(2));
    let report = se.gc_run_once(&operator()).await.unwrap();
    assert_eq!(report.deleted_finalized_safe, 1);
    assert!(
        cluster
            .backend
            .get_descriptor("edit/contract")
            .await
            .unwrap_err()
            .is_not_found()
    );

    // The finalized copy is what readers see afterwards
    let (bytes, _) = cluster.backend.get("ro/contract").await.unwrap();
    assert_eq!(&bytes[..], b"signed contract");
    assert!(se.gc_exists(&service(), desc.file_id).await.unwrap());
}

#[tokio::test]
async fn test_prepared_file_survives_gc() {
    let cluster = Cluster::in_memory();
    let se = cluster.element();

    let desc = se
        .ingest(&service(), upload("edit/draft", b"draft"))
        .await
        .unwrap();
    let txn = se
        .finalize_prepare(&service(), desc.file_id, "edit/draft", "ar/draft", StorageMode::Archived)
        .await
        .unwrap();

    cluster.clock.advance(ChronoDuration::days(90));
    let report = se.gc_run_once(&operator()).await.unwrap();
    assert_eq!(report.candidates, 0);
    assert!(cluster.backend.get_descriptor("edit/draft").await.is_ok());
    assert!(cluster.backend.get_descriptor(&txn.staged_location).await.is_ok());

    let status = se.finalize_status(&service(), txn.txn_id).unwrap();
    assert_eq!(status.status, TransactionStatus::Prepared);
}

#[tokio::test]
async fn test_orphans_reclaimed_only_after_grace() {
    let cluster = Cluster::in_memory();
    let se = cluster.element();

    let young = se
        .ingest(&service(), upload("edit/young", b"young"))
        .await
        .unwrap();
    let old = se.ingest(&service(), upload("edit/old", b"old")).await.unwrap();

    // Lose the cache rows; both descriptors become orphans
    let se = cluster.replica_with_meta("replica-1", Arc::new(MetaStore::open_in_memory().unwrap()));

    cluster.clock.advance(ChronoDuration::days(8));
    // Touch the young file so only the old one is past the grace period
    let (data, desc) = cluster.backend.get("edit/young").await.unwrap();
    let touched = desc.relocated("edit/young", StorageMode::Edit, cluster.clock.now());
    cluster.backend.put("edit/young", data, &touched).await.unwrap();

    let report = se.gc_run_once(&operator()).await.unwrap();
    assert_eq!(report.deleted_orphaned, 1);
    assert!(!se.gc_exists(&service(), old.file_id).await.unwrap());
    assert!(se.gc_exists(&service(), young.file_id).await.unwrap());
}

#[tokio::test]
async fn test_full_rebuild_is_idempotent() {
    let cluster = Cluster::in_memory();
    let se = cluster.element();
    for i in 0..5 {
        let location = format!("edit/doc-{i}");
        se.ingest(
            &service(),
            IngestRequest {
                name: location.clone(),
                location,
                data: Bytes::from(vec![i as u8; 32]),
            },
        )
        .await
        .unwrap();
    }

    let fresh_meta: Arc<dyn MetadataStore> = Arc::new(MetaStore::open_in_memory().unwrap());
    let se = cluster.replica_with_meta("replica-1", fresh_meta.clone());

    let first = se.cache_rebuild(&operator(), RebuildMode::Full).await.unwrap();
    assert_eq!(first.upserted, 5);
    let mut rows_first = fresh_meta.load_cache_rows().unwrap();

    let second = se.cache_rebuild(&operator(), RebuildMode::Full).await.unwrap();
    assert_eq!(second.deltas(), 0);
    let mut rows_second = fresh_meta.load_cache_rows().unwrap();

    rows_first.sort_by_key(|r| r.file_id());
    rows_second.sort_by_key(|r| r.file_id());
    assert_eq!(rows_first, rows_second);

    let check = se.cache_consistency_check(&operator()).await.unwrap();
    assert_eq!(check.consistent, 5);
    assert!(check.is_consistent());
}

#[tokio::test]
async fn test_two_replicas_race_for_leadership() {
    let cluster = Cluster::in_memory();
    let a = cluster.replica("replica-a");
    let b = cluster.replica("replica-b");

    tokio::join!(a.capacity_monitor().tick(), b.capacity_monitor().tick());
    let roles = [
        a.capacity_monitor().role().await,
        b.capacity_monitor().role().await,
    ];
    assert_eq!(roles.iter().filter(|r| **r == ReplicaRole::Leader).count(), 1);
    assert_eq!(roles.iter().filter(|r| **r == ReplicaRole::Follower).count(), 1);
}

#[tokio::test]
async fn test_killed_leader_is_replaced() {
    let cluster = Cluster::in_memory();
    let a = cluster.replica("replica-a");
    let b = cluster.replica("replica-b");

    a.capacity_monitor().tick().await;
    b.capacity_monitor().tick().await;
    assert!(a.capacity_monitor().is_leader().await);
    drop(a);

    // Lease TTL plus one base poll interval
    cluster.clock.advance(ChronoDuration::seconds(40));
    b.capacity_monitor().tick().await;
    assert!(b.capacity_monitor().is_leader().await);

    let snapshot = b.capacity_current(&operator()).await.unwrap();
    assert_eq!(snapshot.polled_by, "replica-b");
}

#[tokio::test]
async fn test_gc_on_one_replica_spares_files_finalized_on_another() {
    let cluster = Cluster::in_memory();
    let writer = cluster.replica("replica-1");
    let collector = cluster.replica("replica-2");

    let desc = writer
        .ingest(&service(), upload("edit/deed", b"title deed"))
        .await
        .unwrap();
    let txn = writer
        .finalize_prepare(&service(), desc.file_id, "edit/deed", "ro/deed", StorageMode::ReadOnly)
        .await
        .unwrap();

    // Past the orphan grace: a replica with its own cache would reclaim these
    cluster.clock.advance(ChronoDuration::days(8));
    let report = collector.gc_run_once(&operator()).await.unwrap();
    assert_eq!(report.candidates, 0);
    assert!(cluster.backend.get_descriptor("edit/deed").await.is_ok());
    assert!(cluster.backend.get_descriptor(&txn.staged_location).await.is_ok());

    writer.finalize_commit(&service(), txn.txn_id).await.unwrap();
    let report = collector.gc_run_once(&operator()).await.unwrap();
    assert_eq!(report.deleted(), 0);

    cluster.clock.advance(ChronoDuration::hours(25));
    let report = collector.gc_run_once(&operator()).await.unwrap();
    assert_eq!(report.deleted_finalized_safe, 1);
    assert_eq!(report.deleted_orphaned, 0);

    let (bytes, stored) = cluster.backend.get("ro/deed").await.unwrap();
    assert_eq!(&bytes[..], b"title deed");
    assert_eq!(stored.mode, StorageMode::ReadOnly);
    let row = collector.file_metadata(&service(), desc.file_id).await.unwrap();
    assert_eq!(row.location(), "ro/deed");
}

#[tokio::test]
async fn test_replicas_share_rows_and_transactions() {
    let cluster = Cluster::in_memory();
    let a = cluster.replica("replica-1");
    let b = cluster.replica("replica-2");

    let desc = a
        .ingest(&service(), upload("edit/memo", b"memo"))
        .await
        .unwrap();
    let row = b.file_metadata(&service(), desc.file_id).await.unwrap();
    assert_eq!(row.location(), "edit/memo");

    // Prepared on one replica, committed on the other
    let txn = b
        .finalize_prepare(&service(), desc.file_id, "edit/memo", "ar/memo", StorageMode::Archived)
        .await
        .unwrap();
    let outcome = a.finalize_commit(&service(), txn.txn_id).await.unwrap();
    assert!(!outcome.already_committed);
    assert_eq!(
        b.finalize_status(&service(), txn.txn_id).unwrap().status,
        TransactionStatus::Committed
    );

    // Either replica refuses to finalize the file a second time
    let err = b
        .finalize_prepare(&service(), desc.file_id, "edit/memo", "ro/memo", StorageMode::ReadOnly)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(cluster.backend.get_descriptor("ro/memo").await.unwrap_err().is_not_found());

    // A full rebuild on the other replica finds nothing to change
    let report = b.cache_rebuild(&operator(), RebuildMode::Full).await.unwrap();
    assert_eq!(report.deltas(), 0);
    assert!(a.cache_consistency_check(&operator()).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_filesystem_backend_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let backend: Arc<dyn StorageBackend> =
        Arc::new(FilesystemBackend::new(dir.path().join("data")).await.unwrap());
    let coord = Arc::new(MemoryCoordinationStore::with_clock(clock.clone()));
    let meta_path = dir.path().join("meta").join("meta.redb");

    let file_id: FileId = {
        let se = StorageElement::new(
            Config::default(),
            backend.clone(),
            Arc::new(MetaStore::open(&meta_path).unwrap()),
            coord.clone(),
            clock.clone(),
        )
        .unwrap();
        let desc = se
            .ingest(&service(), upload("edit/scan", b"scanned page"))
            .await
            .unwrap();
        let txn = se
            .finalize_prepare(&service(), desc.file_id, "edit/scan", "ar/scan", StorageMode::Archived)
            .await
            .unwrap();
        se.finalize_commit(&service(), txn.txn_id).await.unwrap();
        desc.file_id
    };

    // Cache lost: rebuild from the sidecar descriptors alone
    std::fs::remove_file(&meta_path).unwrap();
    let se = StorageElement::new(
        Config::default(),
        backend.clone(),
        Arc::new(MetaStore::open(&meta_path).unwrap()),
        coord,
        clock,
    )
    .unwrap();
    let report = se.cache_rebuild(&operator(), RebuildMode::Full).await.unwrap();
    assert_eq!(report.upserted, 1);

    let row = se.file_metadata(&service(), file_id).await.unwrap();
    assert_eq!(row.mode(), StorageMode::Archived);
    assert_eq!(row.location(), "ar/scan");
}
