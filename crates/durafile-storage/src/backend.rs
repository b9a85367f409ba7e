//! Descriptor store backend trait.
//!
//! A backend stores opaque bytes at a location together with the sidecar
//! [`Descriptor`] describing them. Writes of bytes and descriptor are a
//! single `put`; the descriptor is what listings return, so a location
//! without a descriptor is invisible to every higher layer.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use durafile_common::Descriptor;

/// Size and timestamp of a stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Capacity of the backend as seen by this storage element
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapacityInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

impl CapacityInfo {
    /// Used fraction of total capacity (0.0 to 1.0)
    #[must_use]
    pub fn used_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.used_bytes as f64 / self.total_bytes as f64;
        ratio
    }
}

/// Storage backend holding file bytes and their sidecar descriptors.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Store bytes and descriptor at `location`, replacing any previous copy.
    ///
    /// `descriptor.location` must equal `location`.
    async fn put(&self, location: &str, data: Bytes, descriptor: &Descriptor) -> StorageResult<()>;

    /// Read bytes and descriptor.
    async fn get(&self, location: &str) -> StorageResult<(Bytes, Descriptor)>;

    /// Read only the descriptor.
    async fn get_descriptor(&self, location: &str) -> StorageResult<Descriptor>;

    /// Size and modification time of the bytes at `location`.
    async fn stat(&self, location: &str) -> StorageResult<ObjectStat>;

    /// Total/used/free space for the capacity monitor.
    async fn capacity(&self) -> StorageResult<CapacityInfo>;

    /// All descriptors whose location starts with `prefix`, ordered by location.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<Descriptor>>;

    /// Delete bytes then descriptor. Returns `NotFound` if neither exists.
    async fn delete(&self, location: &str) -> StorageResult<()>;

    /// Delete-if-exists; returns whether anything was removed.
    async fn delete_if_exists(&self, location: &str) -> StorageResult<bool> {
        match self.delete(location).await {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Reject locations that could escape the backend namespace.
pub fn validate_location(location: &str) -> StorageResult<()> {
    if location.is_empty() {
        return Err(StorageError::InvalidLocation("empty location".into()));
    }
    if location.starts_with('/') || location.starts_with('\\') || location.ends_with('/') {
        return Err(StorageError::InvalidLocation(format!(
            "location must be relative and name a file: {location}"
        )));
    }
    for component in location.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(StorageError::InvalidLocation(format!(
                "unsafe path component in {location}"
            )));
        }
    }
    if location.ends_with(crate::filesystem::SIDECAR_SUFFIX) {
        return Err(StorageError::InvalidLocation(format!(
            "location collides with the sidecar suffix: {location}"
        )));
    }
    Ok(())
}

pub(crate) fn check_descriptor_location(location: &str, descriptor: &Descriptor) -> StorageResult<()> {
    if descriptor.location != location {
        return Err(StorageError::InvalidLocation(format!(
            "descriptor for {} claims location {}",
            location, descriptor.location
        )));
    }
    Ok(())
}
