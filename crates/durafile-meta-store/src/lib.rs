//! Durafile Metadata Store - Persistent cache, transaction log and cleanup queue
//!
//! All three tables live in a single redb database per storage element.
//! The cache mirrors descriptors held by the backend and can always be
//! rebuilt from them; the transaction log and cleanup queue cannot.

pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use store::{MetaStore, MetaStoreError, MetaStoreResult, MetadataStore};
pub use types::{CacheRow, CleanupEntry, FinalizeTransaction, TransactionStatus};
