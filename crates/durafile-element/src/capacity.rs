//! Leader-elected capacity monitor.
//!
//! Replicas of one storage element compete for an exclusive lease on
//! `capacity/<cluster>`. Only the leader polls the backend; it publishes
//! each reading to the coordination store with a validity of a few poll
//! intervals. The poll interval adapts to how much usage moves between
//! readings.
//!
//! Readers use [`CapacityMonitor::current`], which prefers the published
//! snapshot, falls back to a jittered direct poll, then to the last
//! reading this replica saw. Every backend poll is bounded by the poll
//! timeout; a poll that overruns it counts as a failed poll.

use crate::metrics::ElementMetrics;
use crate::release_lock;
use crate::task::PeriodicJob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durafile_common::clock::to_chrono;
use durafile_common::config::{CapacityConfig, NodeConfig};
use durafile_common::{Clock, Error, Result};
use durafile_coord::{LockGuard, LockKind, LockManager, LockPriority, capacity_leader_key};
use durafile_storage::{CapacityInfo, StorageBackend};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Consecutive failed renewals after which the leader steps down
const MAX_RENEW_FAILURES: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Follower,
    Leader,
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Follower => "follower",
            Self::Leader => "leader",
        })
    }
}

/// Where a snapshot handed to a reader came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotSource {
    /// A live reading: the published snapshot or a direct poll
    Polled,
    /// Last-known reading served while the backend cannot be polled
    Cached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityHealth {
    Ok,
    Warning,
    Critical,
}

impl CapacityHealth {
    #[must_use]
    pub fn classify(used_ratio: f64, config: &CapacityConfig) -> Self {
        if used_ratio >= config.critical_ratio {
            Self::Critical
        } else if used_ratio >= config.warning_ratio {
            Self::Warning
        } else {
            Self::Ok
        }
    }
}

/// Capacity reading of one storage element
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub element_id: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub measured_at: DateTime<Utc>,
    pub source: SnapshotSource,
    pub health: CapacityHealth,
    /// Replica that took the reading
    pub polled_by: String,
}

impl CapacitySnapshot {
    fn from_info(
        element_id: &str,
        polled_by: &str,
        info: &CapacityInfo,
        measured_at: DateTime<Utc>,
        config: &CapacityConfig,
    ) -> Self {
        Self {
            element_id: element_id.to_string(),
            total_bytes: info.total_bytes,
            used_bytes: info.used_bytes,
            free_bytes: info.free_bytes,
            measured_at,
            source: SnapshotSource::Polled,
            health: CapacityHealth::classify(info.used_ratio(), config),
            polled_by: polled_by.to_string(),
        }
    }
}

/// Coordination key the leader publishes snapshots under
#[must_use]
pub fn snapshot_key(cluster: &str) -> String {
    format!("{}/snapshot", capacity_leader_key(cluster))
}

struct MonitorState {
    role: ReplicaRole,
    lease: Option<LockGuard>,
    renew_failures: u32,
    interval: Duration,
    next_poll_at: Option<DateTime<Utc>>,
    last_used: Option<u64>,
}

/// Capacity monitor of one replica
pub struct CapacityMonitor {
    backend: Arc<dyn StorageBackend>,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    element_id: String,
    leader_key: String,
    snapshot_key: String,
    config: CapacityConfig,
    metrics: Arc<ElementMetrics>,
    state: Mutex<MonitorState>,
    last_known: RwLock<Option<CapacitySnapshot>>,
}

impl CapacityMonitor {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        node: &NodeConfig,
        config: CapacityConfig,
        metrics: Arc<ElementMetrics>,
    ) -> Self {
        let interval = config.base_interval();
        ElementMetrics::set(&metrics.capacity_interval_secs, interval.as_secs());
        Self {
            backend,
            locks,
            clock,
            element_id: node.element_id.clone(),
            leader_key: capacity_leader_key(&node.cluster),
            snapshot_key: snapshot_key(&node.cluster),
            config,
            metrics,
            state: Mutex::new(MonitorState {
                role: ReplicaRole::Follower,
                lease: None,
                renew_failures: 0,
                interval,
                next_poll_at: None,
                last_used: None,
            }),
            last_known: RwLock::new(None),
        }
    }

    pub async fn role(&self) -> ReplicaRole {
        self.state.lock().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == ReplicaRole::Leader
    }

    /// Current adaptive poll interval
    pub async fn interval(&self) -> Duration {
        self.state.lock().await.interval
    }

    /// One step of the election and polling loop. Returns the delay before
    /// the next step.
    pub async fn tick(&self) -> Duration {
        let mut state = self.state.lock().await;
        match state.role {
            ReplicaRole::Follower => self.try_promote(&mut state).await,
            ReplicaRole::Leader => self.renew(&mut state).await,
        }

        let renew_every = self.config.lease_ttl() / 3;
        if state.role == ReplicaRole::Follower {
            return renew_every;
        }

        let now = self.clock.now();
        if state.next_poll_at.is_none_or(|at| now >= at) {
            self.poll_and_publish(&mut state).await;
        }
        let until_poll = state
            .next_poll_at
            .and_then(|at| (at - self.clock.now()).to_std().ok())
            .unwrap_or_default();
        renew_every.min(until_poll.max(Duration::from_millis(100)))
    }

    async fn try_promote(&self, state: &mut MonitorState) {
        match self
            .locks
            .acquire_with_ttl(
                &self.leader_key,
                LockKind::Exclusive,
                LockPriority::High,
                self.config.lease_ttl(),
            )
            .await
        {
            Ok(guard) => {
                state.role = ReplicaRole::Leader;
                state.lease = Some(guard);
                state.renew_failures = 0;
                state.interval = self.config.base_interval();
                state.next_poll_at = None;
                state.last_used = None;
                ElementMetrics::inc(&self.metrics.leadership_changes);
                ElementMetrics::set(&self.metrics.capacity_is_leader, 1);
                info!(
                    "{} became capacity leader for {}",
                    self.locks.owner(),
                    self.leader_key
                );
            }
            Err(Error::LockContention { .. }) => {
                debug!("Capacity leadership held elsewhere");
            }
            Err(e) => warn!("Capacity leadership attempt failed: {}", e),
        }
    }

    async fn renew(&self, state: &mut MonitorState) {
        let Some(lease) = state.lease.as_ref() else {
            self.demote(state, "no lease held").await;
            return;
        };
        let renewed = lease.renew().await;
        match renewed {
            Ok(()) => state.renew_failures = 0,
            Err(Error::LeadershipLost { .. }) => self.demote(state, "lease lost").await,
            Err(e) => {
                state.renew_failures += 1;
                warn!(
                    "Capacity lease renewal failed ({}/{}): {}",
                    state.renew_failures, MAX_RENEW_FAILURES, e
                );
                if state.renew_failures >= MAX_RENEW_FAILURES {
                    self.demote(state, "renewal keeps failing").await;
                }
            }
        }
    }

    async fn demote(&self, state: &mut MonitorState, reason: &str) {
        state.role = ReplicaRole::Follower;
        state.renew_failures = 0;
        state.next_poll_at = None;
        if let Some(lease) = state.lease.take() {
            release_lock(lease).await;
        }
        ElementMetrics::inc(&self.metrics.leadership_changes);
        ElementMetrics::set(&self.metrics.capacity_is_leader, 0);
        info!("{} stepped down as capacity leader: {}", self.locks.owner(), reason);
    }

    /// Give up leadership, e.g. on shutdown.
    pub async fn step_down(&self) {
        let mut state = self.state.lock().await;
        if state.role == ReplicaRole::Leader {
            self.demote(&mut state, "stepping down").await;
        }
    }

    async fn poll_and_publish(&self, state: &mut MonitorState) {
        let now = self.clock.now();
        match self.poll_backend().await {
            Ok(info) => {
                ElementMetrics::inc(&self.metrics.capacity_polls);
                ElementMetrics::set(&self.metrics.capacity_total_bytes, info.total_bytes);
                ElementMetrics::set(&self.metrics.capacity_used_bytes, info.used_bytes);

                let delta = state.last_used.map(|prev| {
                    prev.abs_diff(info.used_bytes) as f64 / info.total_bytes.max(1) as f64
                });
                state.interval = self.next_interval(state.interval, delta);
                state.last_used = Some(info.used_bytes);

                let snapshot = CapacitySnapshot::from_info(
                    &self.element_id,
                    self.locks.owner(),
                    &info,
                    now,
                    &self.config,
                );
                self.publish(&snapshot, state.interval).await;
                *self.last_known.write() = Some(snapshot);
            }
            Err(e) => {
                ElementMetrics::inc(&self.metrics.capacity_poll_errors);
                state.interval = self.shrink(state.interval);
                warn!("Capacity poll failed: {}", e);
            }
        }
        state.next_poll_at = Some(now + to_chrono(state.interval));
        ElementMetrics::set(&self.metrics.capacity_interval_secs, state.interval.as_secs());
    }

    async fn poll_backend(&self) -> Result<CapacityInfo> {
        let timeout = self.config.poll_timeout();
        match tokio::time::timeout(timeout, self.backend.capacity()).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::transient(format!(
                "capacity poll of {} timed out after {:?}",
                self.backend.name(),
                timeout
            ))),
        }
    }

    async fn publish(&self, snapshot: &CapacitySnapshot, interval: Duration) {
        let validity = interval * self.config.snapshot_validity_polls;
        let json = match serde_json::to_string(snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode capacity snapshot: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .locks
            .store()
            .put(&self.snapshot_key, &json, validity)
            .await
        {
            warn!("Failed to publish capacity snapshot: {}", e);
        }
    }

    /// Stable readings stretch the interval, volatile ones shrink it.
    fn next_interval(&self, current: Duration, delta: Option<f64>) -> Duration {
        match delta {
            Some(d) if d < self.config.stability_epsilon => current
                .mul_f64(self.config.growth_factor)
                .min(self.config.max_interval()),
            Some(d) if d >= self.config.volatility_threshold => self.shrink(current),
            _ => current,
        }
    }

    fn shrink(&self, current: Duration) -> Duration {
        current
            .div_f64(self.config.shrink_factor)
            .max(self.config.min_interval())
    }

    /// Capacity of this storage element.
    ///
    /// Fails with `CapacityUnavailable` only when no reading was ever obtained.
    pub async fn current(&self) -> Result<CapacitySnapshot> {
        match self.read_published().await {
            Ok(Some(snapshot)) => {
                *self.last_known.write() = Some(snapshot.clone());
                return Ok(snapshot);
            }
            Ok(None) => {}
            Err(e) => debug!("Published capacity snapshot unreadable: {}", e),
        }

        let jitter = rand::thread_rng().gen_range(0..=self.config.fallback_jitter_ms);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let mut backoff = Duration::from_millis(self.config.fallback_backoff_ms);
        for attempt in 1..=self.config.fallback_attempts {
            ElementMetrics::inc(&self.metrics.capacity_fallback_polls);
            match self.poll_backend().await {
                Ok(info) => {
                    let snapshot = CapacitySnapshot::from_info(
                        &self.element_id,
                        self.locks.owner(),
                        &info,
                        self.clock.now(),
                        &self.config,
                    );
                    *self.last_known.write() = Some(snapshot.clone());
                    return Ok(snapshot);
                }
                Err(e) => {
                    warn!("Direct capacity poll {} failed: {}", attempt, e);
                    if attempt < self.config.fallback_attempts {
                        let jitter = rand::thread_rng()
                            .gen_range(0..=backoff.as_millis().max(1) as u64 / 2);
                        tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                        backoff *= 2;
                    }
                }
            }
        }

        match self.last_known.read().clone() {
            Some(mut snapshot) => {
                snapshot.source = SnapshotSource::Cached;
                Ok(snapshot)
            }
            None => Err(Error::CapacityUnavailable(format!(
                "no capacity reading for {}",
                self.element_id
            ))),
        }
    }

    async fn read_published(&self) -> Result<Option<CapacitySnapshot>> {
        let Some(json) = self.locks.store().get(&self.snapshot_key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[async_trait]
impl PeriodicJob for CapacityMonitor {
    fn name(&self) -> &'static str {
        "capacity-monitor"
    }

    async fn run_once(&self) -> Duration {
        self.tick().await
    }

    fn deadline(&self) -> Duration {
        self.config.tick_deadline()
    }

    fn abandoned(&self) -> Duration {
        ElementMetrics::inc(&self.metrics.jobs_abandoned);
        self.config.lease_ttl() / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, QUOTA_BYTES, SlowBackend};
    use chrono::Duration as ChronoDuration;
    use durafile_common::StorageMode;
    use durafile_storage::BackendOp;

    #[tokio::test(start_paused = true)]
    async fn test_leader_publishes_for_followers() {
        let a = Harness::new();
        let b = a.replica("replica-2");
        a.put_file("edit/a", &[0u8; 1024], StorageMode::Edit).await;

        a.capacity.tick().await;
        b.capacity.tick().await;
        assert!(a.capacity.is_leader().await);
        assert!(!b.capacity.is_leader().await);

        let snapshot = b.capacity.current().await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Polled);
        assert_eq!(snapshot.polled_by, "replica-1");
        assert_eq!(snapshot.used_bytes, 1024);
        assert_eq!(snapshot.total_bytes, QUOTA_BYTES);
        assert_eq!(snapshot.health, CapacityHealth::Ok);

        // Only the leader polled
        assert_eq!(a.metrics.capacity_polls.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(b.metrics.capacity_polls.load(std::sync::atomic::Ordering::Relaxed), 0);
        assert_eq!(
            b.metrics.capacity_fallback_polls.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_election_has_one_leader() {
        let a = Harness::new();
        let b = a.replica("replica-2");
        let c = a.replica("replica-3");

        tokio::join!(a.capacity.tick(), b.capacity.tick(), c.capacity.tick());

        let mut leaders = 0;
        for h in [&a, &b, &c] {
            if h.capacity.is_leader().await {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_takes_over_expired_lease() {
        let a = Harness::new();
        let b = a.replica("replica-2");
        a.capacity.tick().await;
        b.capacity.tick().await;
        assert!(a.capacity.is_leader().await);

        // Leader stalls past its lease
        a.clock.advance(ChronoDuration::seconds(31));
        b.capacity.tick().await;
        assert!(b.capacity.is_leader().await);

        // The old leader notices on its next renewal
        a.capacity.tick().await;
        assert!(!a.capacity.is_leader().await);
        assert!(b.capacity.is_leader().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failed_renewals_demote() {
        let h = Harness::new();
        h.capacity.tick().await;
        assert!(h.capacity.is_leader().await);

        h.coord.fail_next(2);
        h.capacity.tick().await;
        assert!(h.capacity.is_leader().await);
        h.capacity.tick().await;
        assert_eq!(h.capacity.role().await, ReplicaRole::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_adapts_to_volatility() {
        let h = Harness::new();
        h.capacity.tick().await;
        assert_eq!(h.capacity.interval().await, Duration::from_secs(10));

        // Stable usage stretches the interval
        h.clock.advance(ChronoDuration::seconds(10));
        h.capacity.tick().await;
        assert_eq!(h.capacity.interval().await, Duration::from_secs(15));

        // A large jump in usage shrinks it
        h.put_file("edit/big", &vec![0u8; 200 * 1024], StorageMode::Edit)
            .await;
        h.clock.advance(ChronoDuration::seconds(15));
        h.capacity.tick().await;
        assert_eq!(h.capacity.interval().await, Duration::from_millis(7500));

        // Poll errors shrink down to the floor
        h.backend.fail_next(BackendOp::Capacity, 5);
        for _ in 0..5 {
            h.clock.advance(ChronoDuration::seconds(10));
            h.capacity.tick().await;
        }
        assert_eq!(h.capacity.interval().await, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_falls_back_to_direct_poll_then_cache() {
        let h = Harness::new();

        let polled = h.capacity.current().await.unwrap();
        assert_eq!(polled.source, SnapshotSource::Polled);
        assert_eq!(
            h.metrics.capacity_fallback_polls.load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        h.backend.fail_next(BackendOp::Capacity, 10);
        let cached = h.capacity.current().await.unwrap();
        assert_eq!(cached.source, SnapshotSource::Cached);
        assert_eq!(cached.measured_at, polled.measured_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_without_any_reading_is_unavailable() {
        let h = Harness::new();
        h.backend.fail_next(BackendOp::Capacity, 10);
        let err = h.capacity.current().await.unwrap_err();
        assert!(matches!(err, Error::CapacityUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_snapshot_expires() {
        let a = Harness::new();
        let b = a.replica("replica-2");
        a.capacity.tick().await;

        // Three polls at 10s
        a.clock.advance(ChronoDuration::seconds(31));
        b.capacity.current().await.unwrap();
        assert_eq!(
            b.metrics.capacity_fallback_polls.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    fn stalling_monitor(h: &Harness) -> (Arc<SlowBackend>, CapacityMonitor) {
        let backend = Arc::new(SlowBackend::listing_in_steps(h, 0));
        let monitor = CapacityMonitor::new(
            backend.clone(),
            h.locks.clone(),
            h.clock.clone(),
            &h.config.node,
            h.config.capacity.clone(),
            h.metrics.clone(),
        );
        (backend, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_poll_times_out_and_shrinks_interval() {
        let h = Harness::new();
        let (backend, monitor) = stalling_monitor(&h);
        monitor.tick().await;
        assert!(monitor.is_leader().await);

        backend.stall_capacity.store(true, std::sync::atomic::Ordering::SeqCst);
        h.clock.advance(ChronoDuration::seconds(10));
        let started = tokio::time::Instant::now();
        monitor.tick().await;
        assert!(started.elapsed() >= Duration::from_secs(5));

        assert!(monitor.is_leader().await);
        assert_eq!(monitor.interval().await, Duration::from_secs(5));
        assert_eq!(
            h.metrics.capacity_poll_errors.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_direct_polls_fall_back_to_last_reading() {
        let h = Harness::new();
        let (backend, monitor) = stalling_monitor(&h);
        let polled = monitor.current().await.unwrap();

        backend.stall_capacity.store(true, std::sync::atomic::Ordering::SeqCst);
        let cached = monitor.current().await.unwrap();
        assert_eq!(cached.source, SnapshotSource::Cached);
        assert_eq!(cached.measured_at, polled.measured_at);
    }

    #[test]
    fn test_health_thresholds() {
        let config = CapacityConfig::default();
        assert_eq!(CapacityHealth::classify(0.5, &config), CapacityHealth::Ok);
        assert_eq!(CapacityHealth::classify(0.85, &config), CapacityHealth::Warning);
        assert_eq!(CapacityHealth::classify(0.96, &config), CapacityHealth::Critical);
    }
}
