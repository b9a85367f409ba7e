//! Advisory lock manager.
//!
//! Each lock key maps onto a small family of coordination keys:
//!
//! - `<key>/x` holds the token of the exclusive holder
//! - `<key>/s/<token>` is one entry per shared holder
//! - `<key>/w/<token>` is a queued exclusive intent; its value is the
//!   requester's priority
//!
//! Every entry carries a TTL, so a holder that disappears releases its
//! lock when the lease runs out. An exclusive request that waits through
//! [`LockManager::acquire_with_retry`] queues an intent while it is refused;
//! while any intent is live new shared holders are refused, so a steady
//! stream of readers cannot starve a writer. Single attempts never queue.

use crate::store::CoordinationStore;
use durafile_common::config::CoordinationConfig;
use durafile_common::{Error, Result};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-file lock key
#[must_use]
pub fn file_lock_key(file_id: durafile_common::FileId) -> String {
    format!("file/{file_id}")
}

/// Cache rebuild lock key
pub const REBUILD_LOCK_KEY: &str = "cache/rebuild";

/// Garbage collection run lock key
pub const GC_LOCK_KEY: &str = "gc/run";

/// Capacity leadership key for a cluster
#[must_use]
pub fn capacity_leader_key(cluster: &str) -> String {
    format!("capacity/{cluster}")
}

/// Lock mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Priority of an exclusive request waiting behind other holders
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl LockPriority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for LockPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn exclusive_key(key: &str) -> String {
    format!("{key}/x")
}

fn shared_prefix(key: &str) -> String {
    format!("{key}/s/")
}

fn intent_prefix(key: &str) -> String {
    format!("{key}/w/")
}

/// Lease-based advisory lock manager over a [`CoordinationStore`].
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    owner: String,
    lock_ttl: Duration,
    intent_timeout: Duration,
    retry_backoff: Duration,
}

impl LockManager {
    /// `owner` identifies this replica in lock tokens and logs.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        owner: impl Into<String>,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            store,
            owner: owner.into(),
            lock_ttl: config.lock_ttl(),
            intent_timeout: config.intent_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub const fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    fn new_token(&self) -> String {
        format!("{}:{}", self.owner, Uuid::new_v4())
    }

    /// Single attempt with the default lock TTL.
    ///
    /// Returns `Error::LockContention` when the lock is held incompatibly.
    /// A refused attempt leaves nothing queued behind.
    pub async fn acquire(&self, key: &str, kind: LockKind, priority: LockPriority) -> Result<LockGuard> {
        self.acquire_with_ttl(key, kind, priority, self.lock_ttl).await
    }

    /// Single attempt with an explicit lease TTL.
    pub async fn acquire_with_ttl(
        &self,
        key: &str,
        kind: LockKind,
        priority: LockPriority,
        ttl: Duration,
    ) -> Result<LockGuard> {
        let token = self.new_token();
        self.try_acquire(key, kind, priority, ttl, &token, false)
            .await?
            .ok_or_else(|| Error::busy(key))
    }

    /// Retry until `deadline` elapses, backing off with jitter.
    ///
    /// The same token is used for every attempt so a queued exclusive
    /// intent keeps its place. The intent is withdrawn on giving up.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        kind: LockKind,
        priority: LockPriority,
        deadline: Duration,
    ) -> Result<LockGuard> {
        let token = self.new_token();
        let started = Instant::now();
        let mut backoff = self.retry_backoff;
        loop {
            if let Some(guard) = self
                .try_acquire(key, kind, priority, self.lock_ttl, &token, true)
                .await?
            {
                return Ok(guard);
            }
            if started.elapsed() >= deadline {
                debug!("Giving up on lock {} after {:?}", key, deadline);
                if kind == LockKind::Exclusive {
                    let intent_key = format!("{}{token}", intent_prefix(key));
                    self.store
                        .compare_and_delete(&intent_key, priority.as_str())
                        .await?;
                }
                return Err(Error::busy(key));
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2);
            tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    /// Token of the current exclusive holder, if any.
    pub async fn exclusive_holder(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&exclusive_key(key)).await
    }

    async fn try_acquire(
        &self,
        key: &str,
        kind: LockKind,
        priority: LockPriority,
        ttl: Duration,
        token: &str,
        queue_intent: bool,
    ) -> Result<Option<LockGuard>> {
        match kind {
            LockKind::Shared => self.try_shared(key, ttl, token).await,
            LockKind::Exclusive => {
                self.try_exclusive(key, priority, ttl, token, queue_intent)
                    .await
            }
        }
    }

    async fn try_shared(&self, key: &str, ttl: Duration, token: &str) -> Result<Option<LockGuard>> {
        let x_key = exclusive_key(key);
        if self.store.get(&x_key).await?.is_some() {
            return Ok(None);
        }
        if !self.store.list_prefix(&intent_prefix(key)).await?.is_empty() {
            debug!("Shared lock {} refused: exclusive request queued", key);
            return Ok(None);
        }

        let s_key = format!("{}{token}", shared_prefix(key));
        if !self.store.set_if_absent(&s_key, token, ttl).await? {
            return Ok(None);
        }
        // An exclusive holder may have slipped in between the check and the set
        if self.store.get(&x_key).await?.is_some() {
            self.store.compare_and_delete(&s_key, token).await?;
            return Ok(None);
        }

        Ok(Some(LockGuard::new(
            self.store.clone(),
            key,
            s_key,
            token,
            LockKind::Shared,
            ttl,
        )))
    }

    async fn try_exclusive(
        &self,
        key: &str,
        priority: LockPriority,
        ttl: Duration,
        token: &str,
        queue_intent: bool,
    ) -> Result<Option<LockGuard>> {
        let intent_key = format!("{}{token}", intent_prefix(key));

        let outranked = self
            .store
            .list_prefix(&intent_prefix(key))
            .await?
            .into_iter()
            .any(|(k, v)| k != intent_key && LockPriority::parse(&v) > priority);
        if outranked {
            return self.refuse(&intent_key, priority, queue_intent).await;
        }

        let x_key = exclusive_key(key);
        if !self.store.set_if_absent(&x_key, token, ttl).await? {
            return self.refuse(&intent_key, priority, queue_intent).await;
        }

        if !self.store.list_prefix(&shared_prefix(key)).await?.is_empty() {
            self.store.compare_and_delete(&x_key, token).await?;
            debug!("Exclusive lock {} waiting for shared holders", key);
            return self.refuse(&intent_key, priority, queue_intent).await;
        }

        self.store
            .compare_and_delete(&intent_key, priority.as_str())
            .await?;
        Ok(Some(LockGuard::new(
            self.store.clone(),
            key,
            x_key,
            token,
            LockKind::Exclusive,
            ttl,
        )))
    }

    async fn refuse(
        &self,
        intent_key: &str,
        priority: LockPriority,
        queue_intent: bool,
    ) -> Result<Option<LockGuard>> {
        if queue_intent {
            self.store
                .put(intent_key, priority.as_str(), self.intent_timeout)
                .await?;
        }
        Ok(None)
    }
}

/// A held lock lease.
///
/// The lease expires after its TTL unless renewed. Dropping the guard
/// without calling [`LockGuard::release`] releases it in the background.
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    entry_key: String,
    token: String,
    kind: LockKind,
    ttl: Duration,
    released: bool,
}

impl LockGuard {
    fn new(
        store: Arc<dyn CoordinationStore>,
        key: &str,
        entry_key: String,
        token: &str,
        kind: LockKind,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key: key.to_string(),
            entry_key,
            token: token.to_string(),
            kind,
            ttl,
            released: false,
        }
    }

    /// Lock key as passed to `acquire`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub const fn kind(&self) -> LockKind {
        self.kind
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Extend the lease by its TTL.
    ///
    /// Returns `Error::LeadershipLost` if the lease already expired or was
    /// taken over; other errors come from the store and may be transient.
    pub async fn renew(&self) -> Result<()> {
        if self
            .store
            .compare_and_extend(&self.entry_key, &self.token, self.ttl)
            .await?
        {
            Ok(())
        } else {
            Err(Error::LeadershipLost {
                key: self.key.clone(),
            })
        }
    }

    /// Whether this guard still owns the lease.
    pub async fn is_held(&self) -> Result<bool> {
        Ok(self.store.get(&self.entry_key).await?.as_deref() == Some(self.token.as_str()))
    }

    /// Release the lease. Returns whether it was still held.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        self.store
            .compare_and_delete(&self.entry_key, &self.token)
            .await
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let entry_key = std::mem::take(&mut self.entry_key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.compare_and_delete(&entry_key, &token).await {
                warn!("Failed to release lock {}: {}", entry_key, e);
            }
        });
    }
}
