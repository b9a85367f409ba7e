//! Core type definitions for durafile
//!
//! This module defines the identifiers, storage modes and the canonical
//! per-file descriptor shared by every component of a storage element.

use crate::checksum::Checksum;
use chrono::{DateTime, Utc};
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Location prefix reserved for artifacts staged by the finalizer
pub const STAGING_PREFIX: &str = ".staging/";

/// Cache TTL for rows mirroring a mutable file
pub const MUTABLE_CACHE_TTL_HOURS: u32 = 24;

/// Cache TTL for rows mirroring a read-only or archived file
pub const IMMUTABLE_CACHE_TTL_HOURS: u32 = 168;

/// Unique identifier for a stored file
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a new random file ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Key used for this file in the metadata tables
    #[must_use]
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for a finalize transaction
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a new random transaction ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Key used for this transaction in the metadata tables
    #[must_use]
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Mutability class of a stored file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    /// Mutable, still writable by the ingest tier
    #[serde(rename = "EDIT")]
    Edit,
    /// Read-only
    #[serde(rename = "RO")]
    ReadOnly,
    /// Archived, immutable
    #[serde(rename = "AR")]
    Archived,
}

impl StorageMode {
    /// Whether files in this mode may still change
    #[must_use]
    pub const fn is_mutable(self) -> bool {
        matches!(self, Self::Edit)
    }

    /// Cache TTL for rows mirroring a file in this mode
    #[must_use]
    pub const fn cache_ttl_hours(self) -> u32 {
        match self {
            Self::Edit => MUTABLE_CACHE_TTL_HOURS,
            Self::ReadOnly | Self::Archived => IMMUTABLE_CACHE_TTL_HOURS,
        }
    }

    /// Ordering used to pick the canonical copy of a file
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Edit => 0,
            Self::ReadOnly => 1,
            Self::Archived => 2,
        }
    }

    /// Wire name of the mode
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Edit => "EDIT",
            Self::ReadOnly => "RO",
            Self::Archived => "AR",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical per-file sidecar descriptor
///
/// The descriptor stored next to the bytes on the backend is the single
/// source of truth for a file. Metadata cache rows, capacity estimates and
/// queue entries are all derived from it and can be rebuilt from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub file_id: FileId,
    /// Logical (user-facing) name
    pub name: String,
    /// Backend location of the bytes this descriptor describes
    pub location: String,
    pub size: u64,
    pub checksum: Checksum,
    pub mode: StorageMode,
    /// Owner identity (caller subject)
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Descriptor {
    /// Copy of this descriptor re-homed at another location and mode
    #[must_use]
    pub fn relocated(&self, location: impl Into<String>, mode: StorageMode, now: DateTime<Utc>) -> Self {
        Self {
            location: location.into(),
            mode,
            modified_at: now,
            ..self.clone()
        }
    }

    /// Whether this descriptor describes a finalizer staging artifact
    #[must_use]
    pub fn is_staged(&self) -> bool {
        is_staging_location(&self.location)
    }

    /// Whether `self` should be mirrored in preference to `other`
    ///
    /// Higher modes win; within a mode the most recently modified copy wins.
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        (self.mode.rank(), self.modified_at) > (other.mode.rank(), other.modified_at)
    }
}

/// Why the garbage collector selected a stored copy for deletion
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupReason {
    /// Mutable file older than the configured retention
    TtlExpired,
    /// Source copy of a committed file past the safety margin
    FinalizedSafe,
    /// Descriptor with no cache row past the orphan grace period
    Orphaned,
}

impl CleanupReason {
    pub const ALL: [Self; 3] = [Self::FinalizedSafe, Self::TtlExpired, Self::Orphaned];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TtlExpired => "TTL_EXPIRED",
            Self::FinalizedSafe => "FINALIZED_SAFE",
            Self::Orphaned => "ORPHANED",
        }
    }
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location used to stage a file while its finalize transaction is open
#[must_use]
pub fn staged_location(txn_id: TransactionId, file_id: FileId) -> String {
    format!("{STAGING_PREFIX}{txn_id}/{file_id}")
}

/// Whether a location lives in the finalizer staging area
#[must_use]
pub fn is_staging_location(location: &str) -> bool {
    location.starts_with(STAGING_PREFIX)
}
