//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: file id, Value: bincode-encoded CacheRow
pub const FILE_CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("file_cache");

// Key: transaction id, Value: bincode-encoded FinalizeTransaction
pub const FINALIZE_TXNS: TableDefinition<&str, &[u8]> = TableDefinition::new("finalize_txns");

// Key: "<file id>/<location>", Value: bincode-encoded CleanupEntry
pub const CLEANUP_QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("cleanup_queue");
