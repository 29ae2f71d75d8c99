//! TTL policy over a storage backend
//!
//! Implemented once and reused by all three tiers: lazy expiry on read,
//! insertion-order capacity eviction, selective quota recovery, and the
//! sweep used by the background task.

use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::StoreBackend;
use crate::entry::StoredEntry;
use crate::error::CacheError;

/// One cache tier: TTL-and-eviction policy wrapped around a backend
#[derive(Debug)]
pub struct Tier<B> {
    backend: B,
    default_ttl: Duration,
    /// Entry-count bound (memory tier); quota-bounded backends leave this
    /// unset and enforce bytes themselves
    capacity: Option<usize>,
}

impl<B: StoreBackend> Tier<B> {
    pub fn new(backend: B, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            capacity: None,
        }
    }

    pub fn with_capacity(backend: B, default_ttl: Duration, capacity: usize) -> Self {
        Self {
            backend,
            default_ttl,
            capacity: Some(capacity),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Write an entry with `createdAt = now` and `ttl ?? default_ttl`.
    ///
    /// Quota errors never propagate: the tier evicts selectively (expired
    /// entries first, then oldest-inserted) and retries; a write that still
    /// does not fit is dropped with a warning.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        let entry = StoredEntry::new(payload, ttl.unwrap_or(self.default_ttl));

        // Insertion-order eviction when the tier is at entry capacity
        if let Some(capacity) = self.capacity {
            if self.backend.load(key)?.is_none() && self.backend.len()? >= capacity {
                if let Some(oldest) = self.backend.oldest_key()? {
                    debug!(
                        tier = self.backend.name(),
                        key = %oldest,
                        "at capacity, evicting oldest entry"
                    );
                    self.backend.remove(&oldest)?;
                }
            }
        }

        match self.backend.store(key, entry.clone()) {
            Ok(()) => Ok(()),
            Err(CacheError::QuotaExceeded { needed, quota }) => {
                warn!(
                    tier = self.backend.name(),
                    key, needed, quota, "quota exceeded, evicting"
                );
                self.store_after_eviction(key, entry)
            }
            Err(e) => Err(e),
        }
    }

    /// Quota recovery: drop expired entries, then oldest-inserted entries,
    /// until the write fits or the tier is empty. The write is lost
    /// silently if it can never fit.
    fn store_after_eviction(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let now = Self::now_ms();
        for expired in self.backend.expired_keys(now)? {
            self.backend.remove_expired(&expired, now)?;
        }

        loop {
            match self.backend.store(key, entry.clone()) {
                Ok(()) => return Ok(()),
                Err(CacheError::QuotaExceeded { .. }) => match self.backend.oldest_key()? {
                    Some(oldest) if oldest != key => {
                        self.backend.remove(&oldest)?;
                    }
                    _ => {
                        warn!(
                            tier = self.backend.name(),
                            key, "entry cannot fit within quota, dropping write"
                        );
                        return Ok(());
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Read a value. Misses, expired entries, and backend failures all read
    /// as `None`; an expired entry is deleted on the way out.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Self::now_ms();
        match self.backend.load(key) {
            Ok(Some(entry)) => {
                if entry.is_expired(now) {
                    debug!(tier = self.backend.name(), key, "expired on read");
                    let _ = self.backend.remove_expired(key, now);
                    return None;
                }
                match serde_json::from_str(&entry.payload) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(
                            tier = self.backend.name(),
                            key,
                            error = %e,
                            "corrupt payload, removing"
                        );
                        let _ = self.backend.remove(key);
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(tier = self.backend.name(), key, error = %e, "read failed");
                None
            }
        }
    }

    /// Remove one entry; true if it was present
    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.backend.remove(key)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.backend.clear()
    }

    /// Proactively drop expired entries; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Self::now_ms();
        let keys = match self.backend.expired_keys(now) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(tier = self.backend.name(), error = %e, "sweep scan failed");
                return 0;
            }
        };
        let mut removed = 0;
        for key in keys {
            // Re-checked under the backend lock: a write that refreshed the
            // key since the scan is kept
            match self.backend.remove_expired(&key, now) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(tier = self.backend.name(), key, error = %e, "sweep remove failed"),
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.backend.len().unwrap_or(0)
    }

    pub fn used_bytes(&self) -> usize {
        self.backend.used_bytes().unwrap_or(0)
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, SessionBackend};
    use serde_json::{json, Value};
    use std::thread::sleep;

    fn memory_tier() -> Tier<MemoryBackend> {
        Tier::new(MemoryBackend::new(), Duration::from_secs(60))
    }

    #[test]
    fn set_then_get_before_expiry() {
        let tier = memory_tier();
        tier.set("px:BTCUSDT", &json!({"price": 65000}), Some(Duration::from_millis(80)))
            .unwrap();
        let value: Value = tier.get("px:BTCUSDT").unwrap();
        assert_eq!(value, json!({"price": 65000}));
    }

    #[test]
    fn expired_entry_reads_as_miss_and_is_deleted() {
        let tier = memory_tier();
        tier.set("px:BTCUSDT", &json!({"price": 65000}), Some(Duration::from_millis(20)))
            .unwrap();

        sleep(Duration::from_millis(40));
        assert!(tier.get::<Value>("px:BTCUSDT").is_none());
        // Lazy expiry removed the entry, not just hid it
        assert_eq!(tier.len(), 0);
    }

    #[test]
    fn default_ttl_applies_when_unspecified() {
        let tier = Tier::new(MemoryBackend::new(), Duration::from_millis(20));
        tier.set("k", &json!(1), None).unwrap();
        assert!(tier.get::<Value>("k").is_some());
        sleep(Duration::from_millis(40));
        assert!(tier.get::<Value>("k").is_none());
    }

    #[test]
    fn capacity_evicts_exactly_the_oldest_inserted() {
        let tier = Tier::with_capacity(MemoryBackend::new(), Duration::from_secs(60), 3);
        tier.set("a", &json!(1), None).unwrap();
        tier.set("b", &json!(2), None).unwrap();
        tier.set("c", &json!(3), None).unwrap();

        tier.set("d", &json!(4), None).unwrap();
        assert!(tier.get::<Value>("a").is_none());
        assert!(tier.get::<Value>("b").is_some());
        assert!(tier.get::<Value>("c").is_some());
        assert!(tier.get::<Value>("d").is_some());
        assert_eq!(tier.len(), 3);
    }

    #[test]
    fn overwrite_at_capacity_does_not_evict() {
        let tier = Tier::with_capacity(MemoryBackend::new(), Duration::from_secs(60), 2);
        tier.set("a", &json!(1), None).unwrap();
        tier.set("b", &json!(2), None).unwrap();
        tier.set("b", &json!(20), None).unwrap();

        assert_eq!(tier.get::<Value>("a"), Some(json!(1)));
        assert_eq!(tier.get::<Value>("b"), Some(json!(20)));
    }

    #[test]
    fn quota_recovery_evicts_expired_first() {
        // Quota fits two small entries
        let tier = Tier::new(SessionBackend::new(24), Duration::from_secs(60));
        tier.set("dead", &json!("xxxx"), Some(Duration::from_millis(10)))
            .unwrap();
        tier.set("live", &json!("yyyy"), None).unwrap();
        sleep(Duration::from_millis(25));

        // Needs space: the expired entry goes, the live one stays
        tier.set("new", &json!("zzzz"), None).unwrap();
        assert!(tier.get::<Value>("live").is_some());
        assert!(tier.get::<Value>("new").is_some());
        assert!(tier.get::<Value>("dead").is_none());
    }

    #[test]
    fn quota_recovery_falls_back_to_oldest() {
        let tier = Tier::new(SessionBackend::new(24), Duration::from_secs(60));
        tier.set("first", &json!("aaa"), None).unwrap();
        tier.set("second", &json!("bb"), None).unwrap();

        tier.set("third", &json!("cccc"), None).unwrap();
        assert!(tier.get::<Value>("first").is_none());
        assert!(tier.get::<Value>("second").is_some());
        assert!(tier.get::<Value>("third").is_some());
    }

    #[test]
    fn unfittable_write_is_dropped_silently() {
        let tier = Tier::new(SessionBackend::new(16), Duration::from_secs(60));
        tier.set("keep", &json!(1), None).unwrap();

        // Far larger than the whole quota: swallowed, not an error
        tier.set("huge", &json!("x".repeat(100)), None).unwrap();
        assert!(tier.get::<Value>("huge").is_none());
        // Everything evictable was evicted trying to make room
        assert!(tier.get::<Value>("keep").is_none());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let tier = memory_tier();
        tier.set("a", &json!(1), Some(Duration::from_millis(10))).unwrap();
        tier.set("b", &json!(2), Some(Duration::from_millis(10))).unwrap();
        tier.set("c", &json!(3), None).unwrap();

        sleep(Duration::from_millis(30));
        assert_eq!(tier.sweep(), 2);
        assert_eq!(tier.len(), 1);
        assert!(tier.get::<Value>("c").is_some());
    }

    #[test]
    fn delete_and_clear() {
        let tier = memory_tier();
        tier.set("a", &json!(1), None).unwrap();
        tier.set("b", &json!(2), None).unwrap();

        assert!(tier.delete("a").unwrap());
        assert!(!tier.delete("a").unwrap());
        tier.clear().unwrap();
        assert_eq!(tier.len(), 0);
    }
}
