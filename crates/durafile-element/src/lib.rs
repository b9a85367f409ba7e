//! Durafile Element - Consistency and lifecycle core of a storage element
//!
//! Components:
//! - [`Finalizer`]: two-phase move of `EDIT` files to `RO`/`AR`
//! - [`RebuildEngine`]: metadata cache reconstruction from backend descriptors
//! - [`GarbageCollector`]: prioritized reclamation of expired and superseded copies
//! - [`CapacityMonitor`]: leader-elected, adaptively polled capacity snapshots
//! - [`StorageElement`]: caller-facing facade with role checks
//!
//! Background work runs through [`PeriodicTask`].

pub mod capacity;
pub mod element;
pub mod finalizer;
pub mod gc;
pub mod metrics;
pub mod rebuild;
pub mod task;

pub use capacity::{CapacityHealth, CapacityMonitor, CapacitySnapshot, ReplicaRole, SnapshotSource};
pub use element::{IngestRequest, StorageElement};
pub use finalizer::{CommitOutcome, Finalizer, RecoveryReport};
pub use gc::{DeleteReport, GarbageCollector, GcFailure, GcReport};
pub use metrics::ElementMetrics;
pub use rebuild::{ConsistencyReport, RebuildEngine, RebuildMode, RebuildReport};
pub use task::{PeriodicJob, PeriodicTask};

use durafile_common::{Error, FileId, Result};
use durafile_coord::{LockGuard, LockKind, LockManager, LockPriority, file_lock_key};
use std::time::Duration;
use tracing::{debug, warn};

/// How long a per-file operation waits for the file lock
const FILE_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Take the exclusive per-file lock, waiting up to [`FILE_LOCK_WAIT`].
pub(crate) async fn lock_file(
    locks: &LockManager,
    metrics: &ElementMetrics,
    file_id: FileId,
) -> Result<LockGuard> {
    locks
        .acquire_with_retry(
            &file_lock_key(file_id),
            LockKind::Exclusive,
            LockPriority::Normal,
            FILE_LOCK_WAIT,
        )
        .await
        .inspect_err(|e| note_contention(metrics, e))
}

pub(crate) fn note_contention(metrics: &ElementMetrics, err: &Error) {
    if matches!(err, Error::LockContention { .. }) {
        ElementMetrics::inc(&metrics.lock_contention);
    }
}

/// Run `work` while renewing `guard` every third of its TTL.
///
/// A renewal that finds the lease gone drops `work` at its next await
/// point and returns `LeadershipLost`. Transient store errors are retried
/// on the next renewal; the lease itself lapses if they persist.
pub(crate) async fn hold_lease<T>(
    guard: &LockGuard,
    metrics: &ElementMetrics,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let keep_alive = async {
        let period = guard.ttl() / 3;
        loop {
            tokio::time::sleep(period).await;
            match guard.renew().await {
                Ok(()) => debug!("Renewed lock {}", guard.key()),
                Err(e @ Error::LeadershipLost { .. }) => return e,
                Err(e) => warn!("Renewal of lock {} failed, retrying: {}", guard.key(), e),
            }
        }
    };
    tokio::select! {
        result = work => result,
        lost = keep_alive => {
            ElementMetrics::inc(&metrics.lock_leases_lost);
            warn!("Lost lock {} mid-run, ending early", guard.key());
            Err(lost)
        }
    }
}

/// Release a guard; a failed release only shortens to the lease TTL.
pub(crate) async fn release_lock(guard: LockGuard) {
    let key = guard.key().to_string();
    if let Err(e) = guard.release().await {
        warn!("Failed to release lock {}: {}", key, e);
    }
}
