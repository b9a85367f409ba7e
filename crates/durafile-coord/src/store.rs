//! Coordination store abstraction.
//!
//! Locks and leadership leases are built on a key/value store that offers
//! an atomic set-if-absent with expiry plus compare-and-extend and
//! compare-and-delete on the stored value. Expired keys behave exactly
//! like absent keys for every operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durafile_common::clock::to_chrono;
use durafile_common::{Clock, Error, Result, SystemClock};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Shared key/value store with per-key expiry.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Store `value` under `key` only if no live value exists.
    /// Returns whether the value was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Live value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally store `value` under `key`.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reset the expiry of `key` to `ttl` from now if it still holds `expected`.
    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Live `(key, value)` pairs whose key starts with `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process coordination store.
///
/// Replicas sharing one instance (through an `Arc`) see a single
/// linearizable key space.
pub struct MemoryCoordinationStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    failures: Mutex<u32>,
    clock: Arc<dyn Clock>,
}

impl MemoryCoordinationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(0),
            clock,
        }
    }

    /// Make the next `count` operations fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    fn check_fault(&self) -> Result<()> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(Error::transient("coordination store unavailable"));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + to_chrono(ttl)
    }

    fn live<'a>(entry: Option<&'a Entry>, now: DateTime<Utc>) -> Option<&'a Entry> {
        entry.filter(|e| e.expires_at > now)
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_fault()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if Self::live(entries.get(key), now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: self.expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_fault()?;
        let now = self.clock.now();
        let entries = self.entries.lock();
        Ok(Self::live(entries.get(key), now).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_fault()?;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.check_fault()?;
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now && entry.value == expected => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_fault()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let matches = Self::live(entries.get(key), now).is_some_and(|e| e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.check_fault()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        // Drop expired keys while we hold the map anyway
        entries.retain(|_, e| e.expires_at > now);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durafile_common::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryCoordinationStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryCoordinationStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_expiry() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(30);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_operations() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(10);
        store.put("k", "a", ttl).await.unwrap();

        assert!(!store.compare_and_extend("k", "b", ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(8));
        assert!(store.compare_and_extend("k", "a", ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(8));
        assert!(store.get("k").await.unwrap().is_some());

        assert!(!store.compare_and_delete("k", "b").await.unwrap());
        assert!(store.compare_and_delete("k", "a").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_value_cannot_be_extended() {
        let (clock, store) = store();
        store.put("k", "a", Duration::from_secs(5)).await.unwrap();
        clock.advance(chrono::Duration::seconds(6));
        assert!(!store.compare_and_extend("k", "a", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let (clock, store) = store();
        store.put("lock/s/1", "a", Duration::from_secs(5)).await.unwrap();
        store.put("lock/s/2", "b", Duration::from_secs(50)).await.unwrap();
        store.put("lock/x", "c", Duration::from_secs(50)).await.unwrap();

        assert_eq!(store.list_prefix("lock/s/").await.unwrap().len(), 2);
        clock.advance(chrono::Duration::seconds(10));
        let live = store.list_prefix("lock/s/").await.unwrap();
        assert_eq!(live, vec![("lock/s/2".to_string(), "b".to_string())]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (_clock, store) = store();
        store.fail_next(1);
        assert!(store.get("k").await.unwrap_err().is_retryable());
        assert!(store.get("k").await.is_ok());
    }
}
