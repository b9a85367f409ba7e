//! Durafile Common - Shared types and utilities
//!
//! This crate provides the identifiers, descriptor format, error taxonomy,
//! clock and configuration shared by every storage-element component.

pub mod caller;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use caller::{CallerContext, Role};
pub use checksum::Checksum;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, FailureClass, Result};
pub use types::*;
