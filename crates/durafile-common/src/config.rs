//! Configuration types for durafile
//!
//! This module defines configuration structures used across components.
//! Every section implements `Default` and deserializes with missing
//! fields filled from the defaults, so a TOML file only needs to name
//! what it overrides.

use crate::error::{Error, Result};
use crate::types::CleanupReason;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a storage element
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub coordination: CoordinationConfig,
    pub finalizer: FinalizerConfig,
    pub capacity: CapacityConfig,
    pub rebuild: RebuildConfig,
    pub gc: GcConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.capacity.validate()?;
        self.gc.validate()?;
        if self.finalizer.max_commit_attempts == 0 {
            return Err(Error::Configuration(
                "finalizer.max_commit_attempts must be at least 1".into(),
            ));
        }
        if self.coordination.lock_ttl_secs == 0 {
            return Err(Error::Configuration(
                "coordination.lock_ttl_secs must be positive".into(),
            ));
        }
        if self.finalizer.sweep_deadline_secs == 0
            || self.rebuild.run_deadline_secs == 0
            || self.gc.run_deadline_secs == 0
        {
            return Err(Error::Configuration(
                "background run deadlines must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Storage element this replica serves
    pub element_id: String,
    /// Identity of this replica (lease holder name)
    pub replica_id: String,
    /// Cluster key used for leadership
    pub cluster: String,
    /// Directory for the metadata database
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            element_id: "se-1".to_string(),
            replica_id: "replica-1".to_string(),
            cluster: "durafile".to_string(),
            data_dir: PathBuf::from("/var/lib/durafile"),
        }
    }
}

/// Descriptor store backend selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Filesystem,
    Memory,
}

/// Storage backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Root directory for the filesystem backend
    pub root: PathBuf,
    /// Bucket quota reported as total capacity by the memory backend
    pub memory_quota_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Filesystem,
            root: PathBuf::from("/var/lib/durafile/data"),
            memory_quota_bytes: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

/// Lock manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Lease TTL for advisory locks
    pub lock_ttl_secs: u64,
    /// How long a refused exclusive request keeps blocking new shared locks
    pub intent_timeout_secs: u64,
    /// Base backoff between lock attempts (milliseconds)
    pub retry_backoff_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30,
            intent_timeout_secs: 60,
            retry_backoff_ms: 50,
        }
    }
}

impl CoordinationConfig {
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    #[must_use]
    pub const fn intent_timeout(&self) -> Duration {
        Duration::from_secs(self.intent_timeout_secs)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Two-phase finalizer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizerConfig {
    /// Age after which a PREPARED transaction is picked up by recovery
    pub prepare_timeout_secs: u64,
    /// Commit attempts before a transaction is marked FAILED
    pub max_commit_attempts: u32,
    /// Delay between a commit and eligibility of its source copy for deletion
    pub safety_margin_hours: u64,
    /// Recovery sweep interval
    pub sweep_interval_secs: u64,
    /// Longest a recovery sweep may run before it is abandoned
    pub sweep_deadline_secs: u64,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_secs: 10 * 60,
            max_commit_attempts: 3,
            safety_margin_hours: 24,
            sweep_interval_secs: 60,
            sweep_deadline_secs: 5 * 60,
        }
    }
}

impl FinalizerConfig {
    #[must_use]
    pub const fn prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.prepare_timeout_secs)
    }

    #[must_use]
    pub const fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_hours * 3600)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn sweep_deadline(&self) -> Duration {
        Duration::from_secs(self.sweep_deadline_secs)
    }
}

/// Leader-elected capacity monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Leadership lease TTL
    pub lease_ttl_secs: u64,
    /// Starting poll interval
    pub base_interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Interval multiplier after a stable reading
    pub growth_factor: f64,
    /// Interval divisor after an error or a large delta
    pub shrink_factor: f64,
    /// Used-fraction change below which a reading counts as stable
    pub stability_epsilon: f64,
    /// Used-fraction change above which a reading counts as volatile
    pub volatility_threshold: f64,
    /// Snapshot validity, in multiples of the current poll interval
    pub snapshot_validity_polls: u32,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    /// Upper bound of the random delay before a direct fallback poll
    pub fallback_jitter_ms: u64,
    /// Direct poll attempts before serving the last-known snapshot
    pub fallback_attempts: u32,
    pub fallback_backoff_ms: u64,
    /// Longest a single backend capacity poll may take
    pub poll_timeout_secs: u64,
    /// Longest one election and polling step may take
    pub tick_deadline_secs: u64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            base_interval_secs: 10,
            min_interval_secs: 2,
            max_interval_secs: 120,
            growth_factor: 1.5,
            shrink_factor: 2.0,
            stability_epsilon: 0.001,
            volatility_threshold: 0.05,
            snapshot_validity_polls: 3,
            warning_ratio: 0.85,
            critical_ratio: 0.95,
            fallback_jitter_ms: 250,
            fallback_attempts: 3,
            fallback_backoff_ms: 100,
            poll_timeout_secs: 5,
            tick_deadline_secs: 20,
        }
    }
}

impl CapacityConfig {
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    #[must_use]
    pub const fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    #[must_use]
    pub const fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    #[must_use]
    pub const fn tick_deadline(&self) -> Duration {
        Duration::from_secs(self.tick_deadline_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.min_interval_secs > self.base_interval_secs
            || self.base_interval_secs > self.max_interval_secs
        {
            return Err(Error::Configuration(
                "capacity intervals must satisfy min <= base <= max".into(),
            ));
        }
        if self.growth_factor <= 1.0 || self.shrink_factor <= 1.0 {
            return Err(Error::Configuration(
                "capacity growth_factor and shrink_factor must be greater than 1".into(),
            ));
        }
        if !(0.0 < self.warning_ratio && self.warning_ratio < self.critical_ratio)
            || self.critical_ratio > 1.0
        {
            return Err(Error::Configuration(
                "capacity ratios must satisfy 0 < warning < critical <= 1".into(),
            ));
        }
        if self.stability_epsilon > self.volatility_threshold {
            return Err(Error::Configuration(
                "capacity stability_epsilon must not exceed volatility_threshold".into(),
            ));
        }
        if self.poll_timeout_secs == 0 || self.poll_timeout_secs >= self.tick_deadline_secs {
            return Err(Error::Configuration(
                "capacity poll_timeout_secs must be positive and below tick_deadline_secs".into(),
            ));
        }
        Ok(())
    }
}

/// Cache rebuild engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    /// Interval of the background incremental rebuild
    pub incremental_interval_secs: u64,
    /// Offending file ids kept per category in a consistency report
    pub consistency_sample_limit: usize,
    /// Longest a background incremental rebuild may run before it is abandoned
    pub run_deadline_secs: u64,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            incremental_interval_secs: 15 * 60,
            consistency_sample_limit: 20,
            run_deadline_secs: 30 * 60,
        }
    }
}

impl RebuildConfig {
    #[must_use]
    pub const fn incremental_interval(&self) -> Duration {
        Duration::from_secs(self.incremental_interval_secs)
    }

    #[must_use]
    pub const fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }
}

/// Garbage collector configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub interval_secs: u64,
    /// Retention of mutable files before TTL expiry
    pub edit_retention_hours: u64,
    /// Minimum age of an orphaned descriptor before deletion
    pub orphan_grace_hours: u64,
    /// Entries processed per run
    pub batch_size: usize,
    /// Maximum queued entries; lower-priority candidates are dropped first
    pub queue_capacity: usize,
    /// In-run attempts per entry
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Priority of candidate reasons, highest first
    pub reason_order: Vec<CleanupReason>,
    /// Longest a background run may take before it is abandoned
    pub run_deadline_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 3600,
            edit_retention_hours: 30 * 24,
            orphan_grace_hours: 7 * 24,
            batch_size: 100,
            queue_capacity: 10_000,
            max_attempts: 3,
            retry_backoff_ms: 200,
            reason_order: CleanupReason::ALL.to_vec(),
            run_deadline_secs: 3600,
        }
    }
}

impl GcConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn edit_retention(&self) -> Duration {
        Duration::from_secs(self.edit_retention_hours * 3600)
    }

    #[must_use]
    pub const fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_hours * 3600)
    }

    #[must_use]
    pub const fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Queue priority of a reason (0 is served first)
    #[must_use]
    pub fn priority_of(&self, reason: CleanupReason) -> u32 {
        self.reason_order
            .iter()
            .position(|r| *r == reason)
            .map_or(u32::MAX, |p| u32::try_from(p).unwrap_or(u32::MAX))
    }

    fn validate(&self) -> Result<()> {
        for reason in CleanupReason::ALL {
            let count = self.reason_order.iter().filter(|r| **r == reason).count();
            if count != 1 {
                return Err(Error::Configuration(format!(
                    "gc.reason_order must list {reason} exactly once"
                )));
            }
        }
        if self.batch_size == 0 || self.max_attempts == 0 {
            return Err(Error::Configuration(
                "gc.batch_size and gc.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9301".to_string(),
        }
    }
}
