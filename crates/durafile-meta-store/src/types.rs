//! Stored types for metadata persistence.
//!
//! These types are serialized to redb via bincode.

use chrono::{DateTime, Duration, Utc};
use durafile_common::{
    Checksum, CleanupReason, Descriptor, Error, FileId, Result, StorageMode, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache row mirroring the canonical descriptor of one file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRow {
    pub descriptor: Descriptor,
    /// When the row was last refreshed from its descriptor
    pub cache_updated_at: DateTime<Utc>,
    pub ttl_hours: u32,
}

impl CacheRow {
    /// Fresh row mirroring `descriptor`, with the TTL of its mode
    #[must_use]
    pub fn from_descriptor(descriptor: &Descriptor, now: DateTime<Utc>) -> Self {
        Self {
            descriptor: descriptor.clone(),
            cache_updated_at: now,
            ttl_hours: descriptor.mode.cache_ttl_hours(),
        }
    }

    #[must_use]
    pub const fn file_id(&self) -> FileId {
        self.descriptor.file_id
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.descriptor.location
    }

    #[must_use]
    pub const fn mode(&self) -> StorageMode {
        self.descriptor.mode
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.cache_updated_at + Duration::hours(i64::from(self.ttl_hours))
    }

    /// Row may be trusted without consulting the backend
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    /// Every mirrored field matches `descriptor`
    #[must_use]
    pub fn mirrors(&self, descriptor: &Descriptor) -> bool {
        self.descriptor == *descriptor && self.ttl_hours == descriptor.mode.cache_ttl_hours()
    }
}

/// Lifecycle state of a finalize transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Initiated,
    Prepared,
    Committed,
    Failed,
    RolledBack,
}

impl TransactionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    /// No further transitions allowed
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Transaction still owns a staged artifact
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Initiated | Self::Prepared)
    }

    /// Files with a transaction in this state must never be collected
    #[must_use]
    pub const fn protects_file(self) -> bool {
        matches!(self, Self::Initiated | Self::Prepared | Self::Failed)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initiated, Self::Prepared | Self::Failed | Self::RolledBack)
                | (Self::Prepared, Self::Committed | Self::Failed | Self::RolledBack)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one prepare/commit finalize transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeTransaction {
    pub txn_id: TransactionId,
    pub file_id: FileId,
    pub source_location: String,
    pub staged_location: String,
    pub target_location: String,
    pub target_mode: StorageMode,
    pub status: TransactionStatus,
    /// Checksum of the staged bytes, recorded at prepare
    pub staged_checksum: Option<Checksum>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub prepared_at: Option<DateTime<Utc>>,
    pub committed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once the source copy has been collected
    pub source_reclaimed_at: Option<DateTime<Utc>>,
}

impl FinalizeTransaction {
    /// New transaction in `INITIATED`
    #[must_use]
    pub fn initiated(
        txn_id: TransactionId,
        file_id: FileId,
        source_location: impl Into<String>,
        staged_location: impl Into<String>,
        target_location: impl Into<String>,
        target_mode: StorageMode,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            txn_id,
            file_id,
            source_location: source_location.into(),
            staged_location: staged_location.into(),
            target_location: target_location.into(),
            target_mode,
            status: TransactionStatus::Initiated,
            staged_checksum: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            prepared_at: None,
            committed_at: None,
            finished_at: None,
            source_reclaimed_at: None,
        }
    }

    /// Move to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: TransactionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                txn_id: self.txn_id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        match next {
            TransactionStatus::Prepared => self.prepared_at = Some(now),
            TransactionStatus::Committed => self.committed_at = Some(now),
            TransactionStatus::Failed | TransactionStatus::RolledBack => {
                self.finished_at = Some(now);
            }
            TransactionStatus::Initiated => {}
        }
        Ok(())
    }

    /// Time since the transaction last entered its current state
    #[must_use]
    pub fn age_in_state(&self, now: DateTime<Utc>) -> Duration {
        now - self.updated_at
    }
}

/// Queued deletion of one stored copy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupEntry {
    pub file_id: FileId,
    pub location: String,
    pub reason: CleanupReason,
    /// Lower value is processed first
    pub priority: u32,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl CleanupEntry {
    #[must_use]
    pub fn new(
        file_id: FileId,
        location: impl Into<String>,
        reason: CleanupReason,
        priority: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            file_id,
            location: location.into(),
            reason,
            priority,
            attempts: 0,
            enqueued_at: now,
            next_eligible_at: now,
            last_error: None,
        }
    }

    /// Queue key; one entry per stored copy
    #[must_use]
    pub fn key(&self) -> String {
        Self::key_for(self.file_id, &self.location)
    }

    #[must_use]
    pub fn key_for(file_id: FileId, location: &str) -> String {
        format!("{file_id}/{location}")
    }

    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(mode: StorageMode) -> Descriptor {
        let now = Utc::now();
        Descriptor {
            file_id: FileId::new(),
            name: "ledger.csv".into(),
            location: "edit/ledger".into(),
            size: 4,
            checksum: Checksum::compute_full(b"data"),
            mode,
            owner: "svc-ingest".into(),
            created_at: now,
            modified_at: now,
        }
    }

    #[test]
    fn test_cache_row_freshness() {
        let now = Utc::now();
        let row = CacheRow::from_descriptor(&descriptor(StorageMode::Edit), now);
        assert_eq!(row.ttl_hours, 24);
        assert!(row.is_fresh(now + Duration::hours(23)));
        assert!(!row.is_fresh(now + Duration::hours(24)));

        let ro = CacheRow::from_descriptor(&descriptor(StorageMode::ReadOnly), now);
        assert_eq!(ro.ttl_hours, 168);
        assert!(ro.is_fresh(now + Duration::hours(100)));
    }

    #[test]
    fn test_cache_row_mirrors() {
        let desc = descriptor(StorageMode::Edit);
        let row = CacheRow::from_descriptor(&desc, Utc::now());
        assert!(row.mirrors(&desc));

        let moved = desc.relocated("ro/ledger", StorageMode::ReadOnly, Utc::now());
        assert!(!row.mirrors(&moved));
    }

    #[test]
    fn test_transaction_transitions() {
        let now = Utc::now();
        let mut txn = FinalizeTransaction::initiated(
            TransactionId::new(),
            FileId::new(),
            "edit/a",
            ".staging/t/a",
            "ro/a",
            StorageMode::ReadOnly,
            now,
        );
        txn.transition(TransactionStatus::Prepared, now).unwrap();
        assert_eq!(txn.prepared_at, Some(now));
        txn.transition(TransactionStatus::Committed, now).unwrap();
        assert_eq!(txn.committed_at, Some(now));
        assert!(txn.status.is_terminal());

        let err = txn.transition(TransactionStatus::RolledBack, now).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_failed_cannot_commit() {
        assert!(!TransactionStatus::Failed.can_transition_to(TransactionStatus::Committed));
        assert!(TransactionStatus::Failed.protects_file());
        assert!(!TransactionStatus::Committed.protects_file());
    }

    #[test]
    fn test_cleanup_entry_key() {
        let file_id = FileId::new();
        let entry = CleanupEntry::new(file_id, "edit/a", CleanupReason::TtlExpired, 1, Utc::now());
        assert_eq!(entry.key(), format!("{file_id}/edit/a"));
        assert!(entry.is_eligible(entry.enqueued_at));
    }
}
