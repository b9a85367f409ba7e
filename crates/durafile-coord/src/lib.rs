//! Durafile Coordination - Advisory locks and leadership leases
//!
//! Replicas of a storage element coordinate only through a shared
//! [`CoordinationStore`]. The [`LockManager`] builds shared/exclusive
//! advisory locks with priority intents on top of it; leadership for the
//! capacity monitor is an exclusive lock with its own lease TTL.

pub mod lock;
pub mod store;

// Re-exports
pub use lock::{
    GC_LOCK_KEY, LockGuard, LockKind, LockManager, LockPriority, REBUILD_LOCK_KEY,
    capacity_leader_key, file_lock_key,
};
pub use store::{CoordinationStore, MemoryCoordinationStore};
