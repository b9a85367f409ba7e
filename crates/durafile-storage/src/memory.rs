//! In-memory descriptor store.
//!
//! Used by tests and single-node development setups. Capacity is a fixed
//! quota against which stored bytes are accounted. Individual operations
//! can be made to fail to exercise retry and recovery paths.

use crate::backend::{
    CapacityInfo, ObjectStat, StorageBackend, check_descriptor_location, validate_location,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use durafile_common::{Clock, Descriptor, SystemClock};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Backend operation that can be made to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Put,
    Get,
    Delete,
    List,
    Capacity,
}

struct StoredObject {
    data: Bytes,
    descriptor: Descriptor,
    written_at: DateTime<Utc>,
}

/// In-memory descriptor store.
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    quota_bytes: RwLock<u64>,
    faults: RwLock<HashMap<BackendOp, u32>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    /// Create an empty backend with the given capacity quota.
    #[must_use]
    pub fn new(quota_bytes: u64) -> Self {
        Self::with_clock(quota_bytes, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(quota_bytes: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            quota_bytes: RwLock::new(quota_bytes),
            faults: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Change the reported total capacity.
    pub fn set_quota(&self, quota_bytes: u64) {
        *self.quota_bytes.write() = quota_bytes;
    }

    /// Make the next `count` calls of `op` fail with `Unavailable`.
    pub fn fail_next(&self, op: BackendOp, count: u32) {
        self.faults.write().insert(op, count);
    }

    /// Bytes currently stored.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.objects.read().values().map(|o| o.data.len() as u64).sum()
    }

    /// Number of stored locations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn check_fault(&self, op: BackendOp) -> StorageResult<()> {
        let mut faults = self.faults.write();
        if let Some(remaining) = faults.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StorageError::Unavailable(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1024 * 1024 * 1024)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, location: &str, data: Bytes, descriptor: &Descriptor) -> StorageResult<()> {
        self.check_fault(BackendOp::Put)?;
        validate_location(location)?;
        check_descriptor_location(location, descriptor)?;

        let quota = *self.quota_bytes.read();
        let mut objects = self.objects.write();
        let replaced = objects.get(location).map_or(0, |o| o.data.len() as u64);
        let used: u64 = objects.values().map(|o| o.data.len() as u64).sum();
        let available = quota.saturating_sub(used - replaced);
        if data.len() as u64 > available {
            return Err(StorageError::QuotaExceeded {
                required: data.len() as u64,
                available,
            });
        }

        objects.insert(
            location.to_string(),
            StoredObject {
                data,
                descriptor: descriptor.clone(),
                written_at: self.clock.now(),
            },
        );
        Ok(())
    }

    async fn get(&self, location: &str) -> StorageResult<(Bytes, Descriptor)> {
        self.check_fault(BackendOp::Get)?;
        self.objects
            .read()
            .get(location)
            .map(|o| (o.data.clone(), o.descriptor.clone()))
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }

    async fn get_descriptor(&self, location: &str) -> StorageResult<Descriptor> {
        self.check_fault(BackendOp::Get)?;
        self.objects
            .read()
            .get(location)
            .map(|o| o.descriptor.clone())
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }

    async fn stat(&self, location: &str) -> StorageResult<ObjectStat> {
        self.check_fault(BackendOp::Get)?;
        self.objects
            .read()
            .get(location)
            .map(|o| ObjectStat {
                size: o.data.len() as u64,
                modified_at: o.written_at,
            })
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }

    async fn capacity(&self) -> StorageResult<CapacityInfo> {
        self.check_fault(BackendOp::Capacity)?;
        let total_bytes = *self.quota_bytes.read();
        let used_bytes = self.used_bytes().min(total_bytes);
        Ok(CapacityInfo {
            total_bytes,
            used_bytes,
            free_bytes: total_bytes - used_bytes,
        })
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<Descriptor>> {
        self.check_fault(BackendOp::List)?;
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(loc, _)| loc.starts_with(prefix))
            .map(|(_, o)| o.descriptor.clone())
            .collect())
    }

    async fn delete(&self, location: &str) -> StorageResult<()> {
        self.check_fault(BackendOp::Delete)?;
        self.objects
            .write()
            .remove(location)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durafile_common::{Checksum, FileId, StorageMode};

    fn descriptor(location: &str, data: &[u8]) -> Descriptor {
        let now = Utc::now();
        Descriptor {
            file_id: FileId::new(),
            name: "scan.tiff".into(),
            location: location.into(),
            size: data.len() as u64,
            checksum: Checksum::compute_full(data),
            mode: StorageMode::Edit,
            owner: "svc-ingest".into(),
            created_at: now,
            modified_at: now,
        }
    }

    #[tokio::test]
    async fn test_quota_accounting() {
        let backend = MemoryBackend::new(10);
        backend
            .put("edit/a", Bytes::from_static(b"123456"), &descriptor("edit/a", b"123456"))
            .await
            .unwrap();

        let err = backend
            .put("edit/b", Bytes::from_static(b"123456"), &descriptor("edit/b", b"123456"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { available: 4, .. }));

        // Overwriting reuses the replaced object's space
        backend
            .put("edit/a", Bytes::from_static(b"1234567890"), &descriptor("edit/a", b"1234567890"))
            .await
            .unwrap();

        let cap = backend.capacity().await.unwrap();
        assert_eq!(cap.used_bytes, 10);
        assert_eq!(cap.free_bytes, 0);
    }

    #[tokio::test]
    async fn test_list_prefix_ordering() {
        let backend = MemoryBackend::default();
        for loc in ["ro/b", "edit/z", "ro/a", "rollup/x"] {
            backend
                .put(loc, Bytes::from_static(b"d"), &descriptor(loc, b"d"))
                .await
                .unwrap();
        }
        let listed: Vec<String> = backend
            .list("ro/")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.location)
            .collect();
        assert_eq!(listed, vec!["ro/a".to_string(), "ro/b".to_string()]);
        assert_eq!(backend.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let backend = MemoryBackend::default();
        backend.fail_next(BackendOp::Capacity, 2);

        assert!(backend.capacity().await.is_err());
        assert!(backend.capacity().await.is_err());
        assert!(backend.capacity().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let backend = MemoryBackend::default();
        assert!(backend.delete("edit/none").await.unwrap_err().is_not_found());
        assert!(!backend.delete_if_exists("edit/none").await.unwrap());
    }
}
