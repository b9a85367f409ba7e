//! Persistent metadata store backed by redb.
//!
//! Provides typed put/get/delete/load methods for each table. All writes
//! are synchronous (write txn + commit). Callers serialize writes for one
//! file through the per-file advisory lock; the store itself only
//! guarantees that each method is applied atomically.

use crate::tables;
use crate::types::{CacheRow, CleanupEntry, FinalizeTransaction};
use durafile_common::{FileId, TransactionId};
use redb::{Database, ReadableTable, ReadableTableMetadata};
use std::path::Path;
use tracing::error;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for durafile_common::Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Bincode(e) => Self::Serialization(e.to_string()),
            MetaStoreError::Io(e) => Self::TransientIo(e.to_string()),
            other => Self::MetaStore(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Cache rows, finalize transactions and the cleanup queue of one storage
/// element.
///
/// Every replica of an element must see the same store: the GC decides
/// what is protected, orphaned or reclaimable from these tables, so a
/// replica with a private copy would delete other replicas' files. Each
/// method is applied atomically; callers serialize writes for one file
/// through the per-file advisory lock.
pub trait MetadataStore: Send + Sync {
    fn put_cache_row(&self, row: &CacheRow) -> MetaStoreResult<()>;

    fn get_cache_row(&self, file_id: FileId) -> MetaStoreResult<Option<CacheRow>>;

    /// Returns whether a row was removed.
    fn delete_cache_row(&self, file_id: FileId) -> MetaStoreResult<bool>;

    /// Delete the row only if it still points at `location`.
    fn delete_cache_row_if_location(
        &self,
        file_id: FileId,
        location: &str,
    ) -> MetaStoreResult<bool>;

    fn load_cache_rows(&self) -> MetaStoreResult<Vec<CacheRow>>;

    fn cache_row_count(&self) -> MetaStoreResult<u64>;

    fn put_txn(&self, txn: &FinalizeTransaction) -> MetaStoreResult<()>;

    fn get_txn(&self, txn_id: TransactionId) -> MetaStoreResult<Option<FinalizeTransaction>>;

    fn load_txns(&self) -> MetaStoreResult<Vec<FinalizeTransaction>>;

    /// All transactions ever opened for `file_id`, oldest first.
    fn txns_for_file(&self, file_id: FileId) -> MetaStoreResult<Vec<FinalizeTransaction>>;

    /// Persist a committed transaction together with the cache row it produced.
    fn put_txn_and_cache_row(
        &self,
        txn: &FinalizeTransaction,
        row: &CacheRow,
    ) -> MetaStoreResult<()>;

    fn put_cleanup_entry(&self, entry: &CleanupEntry) -> MetaStoreResult<()>;

    fn get_cleanup_entry(
        &self,
        file_id: FileId,
        location: &str,
    ) -> MetaStoreResult<Option<CleanupEntry>>;

    fn delete_cleanup_entry(&self, file_id: FileId, location: &str) -> MetaStoreResult<bool>;

    fn delete_cleanup_entries_for_file(&self, file_id: FileId) -> MetaStoreResult<usize>;

    fn load_cleanup_queue(&self) -> MetaStoreResult<Vec<CleanupEntry>>;

    /// Record a completed deletion in one write: drop the queue entry,
    /// drop the cache row if it still points at the deleted location and
    /// persist the updated transaction, if any. Returns whether the row
    /// was removed.
    fn complete_cleanup(
        &self,
        entry: &CleanupEntry,
        txn: Option<&FinalizeTransaction>,
    ) -> MetaStoreResult<bool>;
}

/// [`MetadataStore`] in a single redb database.
///
/// Share one instance (behind an `Arc`) between all replicas in a process.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Database::create(path)?)
    }

    /// Open a store that lives only in memory.
    pub fn open_in_memory() -> MetaStoreResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> MetaStoreResult<Self> {
        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::FILE_CACHE)?;
            let _t = write_txn.open_table(tables::FINALIZE_TXNS)?;
            let _t = write_txn.open_table(tables::CLEANUP_QUEUE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl MetadataStore for MetaStore {
    // ---- File cache ----

    fn put_cache_row(&self, row: &CacheRow) -> MetaStoreResult<()> {
        self.put_bincode(tables::FILE_CACHE, &row.file_id().key(), row)
    }

    fn get_cache_row(&self, file_id: FileId) -> MetaStoreResult<Option<CacheRow>> {
        self.get_bincode(tables::FILE_CACHE, &file_id.key())
    }

    fn delete_cache_row(&self, file_id: FileId) -> MetaStoreResult<bool> {
        self.delete_key(tables::FILE_CACHE, &file_id.key())
    }

    fn delete_cache_row_if_location(
        &self,
        file_id: FileId,
        location: &str,
    ) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(tables::FILE_CACHE)?;
            remove_row_if_location(&mut table, file_id, location)?
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn load_cache_rows(&self) -> MetaStoreResult<Vec<CacheRow>> {
        Ok(self
            .load_bincode_table(tables::FILE_CACHE)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    fn cache_row_count(&self) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::FILE_CACHE)?;
        Ok(table.len()?)
    }

    // ---- Finalize transactions ----

    fn put_txn(&self, txn: &FinalizeTransaction) -> MetaStoreResult<()> {
        self.put_bincode(tables::FINALIZE_TXNS, &txn.txn_id.key(), txn)
    }

    fn get_txn(&self, txn_id: TransactionId) -> MetaStoreResult<Option<FinalizeTransaction>> {
        self.get_bincode(tables::FINALIZE_TXNS, &txn_id.key())
    }

    fn load_txns(&self) -> MetaStoreResult<Vec<FinalizeTransaction>> {
        Ok(self
            .load_bincode_table(tables::FINALIZE_TXNS)?
            .into_iter()
            .map(|(_, txn)| txn)
            .collect())
    }

    fn txns_for_file(&self, file_id: FileId) -> MetaStoreResult<Vec<FinalizeTransaction>> {
        let mut txns: Vec<_> = self
            .load_txns()?
            .into_iter()
            .filter(|t| t.file_id == file_id)
            .collect();
        txns.sort_by_key(|t| t.created_at);
        Ok(txns)
    }

    fn put_txn_and_cache_row(
        &self,
        txn: &FinalizeTransaction,
        row: &CacheRow,
    ) -> MetaStoreResult<()> {
        let txn_bytes = bincode::serialize(txn)?;
        let row_bytes = bincode::serialize(row)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(tables::FINALIZE_TXNS)?;
            t.insert(txn.txn_id.key().as_str(), txn_bytes.as_slice())?;
            let mut t2 = write_txn.open_table(tables::FILE_CACHE)?;
            t2.insert(row.file_id().key().as_str(), row_bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Cleanup queue ----

    fn put_cleanup_entry(&self, entry: &CleanupEntry) -> MetaStoreResult<()> {
        self.put_bincode(tables::CLEANUP_QUEUE, &entry.key(), entry)
    }

    fn get_cleanup_entry(
        &self,
        file_id: FileId,
        location: &str,
    ) -> MetaStoreResult<Option<CleanupEntry>> {
        self.get_bincode(tables::CLEANUP_QUEUE, &CleanupEntry::key_for(file_id, location))
    }

    fn delete_cleanup_entry(&self, file_id: FileId, location: &str) -> MetaStoreResult<bool> {
        self.delete_key(tables::CLEANUP_QUEUE, &CleanupEntry::key_for(file_id, location))
    }

    fn delete_cleanup_entries_for_file(&self, file_id: FileId) -> MetaStoreResult<usize> {
        self.delete_keys_with_prefix(tables::CLEANUP_QUEUE, &format!("{file_id}/"))
    }

    fn load_cleanup_queue(&self) -> MetaStoreResult<Vec<CleanupEntry>> {
        Ok(self
            .load_bincode_table(tables::CLEANUP_QUEUE)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    fn complete_cleanup(
        &self,
        entry: &CleanupEntry,
        txn: Option<&FinalizeTransaction>,
    ) -> MetaStoreResult<bool> {
        let txn_bytes = txn.map(bincode::serialize).transpose()?;
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut queue = write_txn.open_table(tables::CLEANUP_QUEUE)?;
            queue.remove(entry.key().as_str())?;
            let mut cache = write_txn.open_table(tables::FILE_CACHE)?;
            let removed = remove_row_if_location(&mut cache, entry.file_id, &entry.location)?;
            if let (Some(txn), Some(bytes)) = (txn, txn_bytes) {
                let mut txns = write_txn.open_table(tables::FINALIZE_TXNS)?;
                txns.insert(txn.txn_id.key().as_str(), bytes.as_slice())?;
            }
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

impl MetaStore {
    // ---- Generic helpers ----

    fn put_bytes(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn put_bincode<T: serde::Serialize>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(value)?;
        self.put_bytes(table_def, key, &bytes)
    }

    fn get_bincode<T: serde::de::DeserializeOwned>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> MetaStoreResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        match table.get(key)? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    fn delete_key(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(table_def)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn load_bincode_table<T: serde::de::DeserializeOwned>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
    ) -> MetaStoreResult<Vec<(String, T)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let bytes = entry.1.value();
            match bincode::deserialize::<T>(bytes) {
                Ok(val) => result.push((key, val)),
                Err(e) => error!("Failed to decode entry '{}': {}", key, e),
            }
        }
        Ok(result)
    }

    fn delete_keys_with_prefix(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> MetaStoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let count = {
            let mut table = write_txn.open_table(table_def)?;
            // Collect keys first, then delete
            let mut keys = Vec::new();
            for entry in table.range(prefix..)? {
                let entry = entry?;
                let k = entry.0.value().to_string();
                if !k.starts_with(prefix) {
                    break;
                }
                keys.push(k);
            }
            for key in &keys {
                table.remove(key.as_str())?;
            }
            keys.len()
        };
        write_txn.commit()?;
        Ok(count)
    }
}

fn remove_row_if_location(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    file_id: FileId,
    location: &str,
) -> MetaStoreResult<bool> {
    let key = file_id.key();
    let matches = match table.get(key.as_str())? {
        Some(val) => bincode::deserialize::<CacheRow>(val.value())?.location() == location,
        None => false,
    };
    if matches {
        table.remove(key.as_str())?;
    }
    Ok(matches)
}
