//! Durafile Storage - Descriptor store backends
//!
//! This crate implements the byte-and-descriptor store underneath a
//! storage element:
//! - The `StorageBackend` trait used by every lifecycle component
//! - A local filesystem backend with JSON sidecar descriptors
//! - An in-memory backend with quota accounting and fault injection

pub mod backend;
pub mod error;
pub mod filesystem;
pub mod memory;

// Re-exports
pub use backend::{CapacityInfo, ObjectStat, StorageBackend, validate_location};
pub use error::{StorageError, StorageResult};
pub use filesystem::{FilesystemBackend, SIDECAR_SUFFIX};
pub use memory::{BackendOp, MemoryBackend};
