//! Local filesystem descriptor store.
//!
//! Bytes live at `<root>/<location>` and the descriptor in a JSON sidecar
//! at `<root>/<location>.desc.json`. Both are written through a temporary
//! file, fsynced and renamed into place; the sidecar is written last so a
//! listed descriptor always has its bytes behind it.

use crate::backend::{
    CapacityInfo, ObjectStat, StorageBackend, check_descriptor_location, validate_location,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use durafile_common::Descriptor;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix of the sidecar descriptor file
pub const SIDECAR_SUFFIX: &str = ".desc.json";

/// Local filesystem descriptor store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, location: &str) -> StorageResult<PathBuf> {
        validate_location(location)?;
        Ok(self.root.join(location))
    }

    fn sidecar_path(data_path: &Path) -> PathBuf {
        let mut name = data_path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    /// Write to a uniquely named temp file, fsync, then rename over `path`.
    async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        let temp_path = path.with_file_name(
            path.file_name()
                .map_or_else(|| temp_name.clone(), |n| format!("{}{}", n.to_string_lossy(), temp_name)),
        );
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_descriptor_at(location: &str, sidecar: &Path) -> StorageResult<Descriptor> {
        let raw = fs::read(sidecar).await.map_err(|e| not_found_or_io(e, location))?;
        serde_json::from_slice(&raw).map_err(|source| StorageError::Descriptor {
            location: location.to_string(),
            source,
        })
    }

    /// Remove now-empty directories between `path` and the root.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    fn location_of(&self, sidecar: &Path) -> Option<String> {
        let rel = sidecar.strip_prefix(&self.root).ok()?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        rel.strip_suffix(SIDECAR_SUFFIX).map(str::to_string)
    }
}

fn not_found_or_io(e: std::io::Error, location: &str) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(location.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn put(&self, location: &str, data: Bytes, descriptor: &Descriptor) -> StorageResult<()> {
        check_descriptor_location(location, descriptor)?;
        let path = self.data_path(location)?;
        let encoded = serde_json::to_vec_pretty(descriptor).map_err(|source| {
            StorageError::Descriptor {
                location: location.to_string(),
                source,
            }
        })?;

        Self::write_atomic(&path, &data).await?;
        Self::write_atomic(&Self::sidecar_path(&path), &encoded).await?;
        debug!("Stored {} bytes at {}", data.len(), location);
        Ok(())
    }

    async fn get(&self, location: &str) -> StorageResult<(Bytes, Descriptor)> {
        let path = self.data_path(location)?;
        let descriptor = Self::read_descriptor_at(location, &Self::sidecar_path(&path)).await?;
        let data = fs::read(&path).await.map_err(|e| not_found_or_io(e, location))?;
        Ok((Bytes::from(data), descriptor))
    }

    async fn get_descriptor(&self, location: &str) -> StorageResult<Descriptor> {
        let path = self.data_path(location)?;
        Self::read_descriptor_at(location, &Self::sidecar_path(&path)).await
    }

    async fn stat(&self, location: &str) -> StorageResult<ObjectStat> {
        let path = self.data_path(location)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(e, location))?;
        let modified_at = metadata
            .modified()
            .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
        Ok(ObjectStat {
            size: metadata.len(),
            modified_at,
        })
    }

    async fn capacity(&self) -> StorageResult<CapacityInfo> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let stats = nix::sys::statvfs::statvfs(&root)
                .map_err(|e| StorageError::Io(std::io::Error::from(e)))?;
            #[allow(clippy::unnecessary_cast)]
            let fragment = stats.fragment_size() as u64;
            #[allow(clippy::unnecessary_cast)]
            let total_bytes = stats.blocks() as u64 * fragment;
            #[allow(clippy::unnecessary_cast)]
            let free_bytes = stats.blocks_available() as u64 * fragment;
            #[allow(clippy::unnecessary_cast)]
            let used_bytes = total_bytes.saturating_sub(stats.blocks_free() as u64 * fragment);
            Ok(CapacityInfo {
                total_bytes,
                used_bytes,
                free_bytes,
            })
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("statvfs task failed: {e}")))?
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<Descriptor>> {
        // Start from the deepest directory the prefix names completely
        let start = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        match fs::try_exists(&start).await {
            Ok(true) => {}
            Ok(false) => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut results = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let Some(location) = self.location_of(&path) else {
                    continue;
                };
                if !location.starts_with(prefix) {
                    continue;
                }
                match Self::read_descriptor_at(&location, &path).await {
                    Ok(descriptor) => results.push(descriptor),
                    // Deleted between read_dir and read
                    Err(StorageError::NotFound(_)) => {}
                    Err(e) => warn!("Skipping unreadable descriptor {}: {}", location, e),
                }
            }
        }

        results.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(results)
    }

    async fn delete(&self, location: &str) -> StorageResult<()> {
        let path = self.data_path(location)?;
        let sidecar = Self::sidecar_path(&path);

        let bytes_removed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let sidecar_removed = match fs::remove_file(&sidecar).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if !bytes_removed && !sidecar_removed {
            return Err(StorageError::NotFound(location.to_string()));
        }
        self.prune_empty_parents(&path).await;
        debug!("Deleted {}", location);
        Ok(())
    }
}
