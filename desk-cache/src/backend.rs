//! Pluggable key-value backends
//!
//! A backend is a dumb key-value store; TTL policy, capacity eviction, and
//! quota recovery live in [`crate::tier::Tier`] and are implemented once for
//! all backends. In-process backends are here; the SQLite-backed durable
//! store is in [`crate::durable`].

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::entry::StoredEntry;
use crate::error::CacheError;

/// Storage backend for one cache tier
pub trait StoreBackend: Send + Sync {
    /// Short name for logs ("memory", "session", "durable")
    fn name(&self) -> &'static str;

    fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheError>;

    /// Insert or overwrite. May fail with [`CacheError::QuotaExceeded`] on
    /// quota-bounded backends.
    fn store(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError>;

    /// Remove a key; true if it was present
    fn remove(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove a key only if its entry is expired at `now_ms`; true if
    /// removed. The check-and-delete is atomic so a write landing after an
    /// expiry scan is never deleted.
    fn remove_expired(&self, key: &str, now_ms: i64) -> Result<bool, CacheError>;

    fn clear(&self) -> Result<(), CacheError>;

    fn len(&self) -> Result<usize, CacheError>;

    /// Oldest-inserted surviving key (eviction order is insertion order,
    /// not LRU)
    fn oldest_key(&self) -> Result<Option<String>, CacheError>;

    /// Keys whose entries are expired at `now_ms`
    fn expired_keys(&self, now_ms: i64) -> Result<Vec<String>, CacheError>;

    fn used_bytes(&self) -> Result<usize, CacheError>;
}

// ============================================================================
// In-process map (memory tier)
// ============================================================================

/// Unbounded in-process store. The memory tier bounds it by entry count at
/// the policy layer.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<IndexMap<String, StoredEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn store(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        // IndexMap keeps the original position on overwrite, preserving
        // insertion order for eviction
        self.entries.write().insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.write().shift_remove(key).is_some())
    }

    fn remove_expired(&self, key: &str, now_ms: i64) -> Result<bool, CacheError> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now_ms) => {
                entries.shift_remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.read().len())
    }

    fn oldest_key(&self) -> Result<Option<String>, CacheError> {
        Ok(self.entries.read().first().map(|(k, _)| k.clone()))
    }

    fn expired_keys(&self, now_ms: i64) -> Result<Vec<String>, CacheError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn used_bytes(&self) -> Result<usize, CacheError> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, e)| e.size_bytes(k))
            .sum())
    }
}

// ============================================================================
// Quota-bounded process-lifetime map (session tier)
// ============================================================================

/// Ephemeral per-session store: lives only as long as the process, bounded
/// by a byte quota like the browser storage it stands in for.
#[derive(Debug)]
pub struct SessionBackend {
    entries: RwLock<IndexMap<String, StoredEntry>>,
    quota_bytes: usize,
}

impl SessionBackend {
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
            quota_bytes,
        }
    }
}

impl StoreBackend for SessionBackend {
    fn name(&self) -> &'static str {
        "session"
    }

    fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn store(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write();
        let replaced: usize = entries.get(key).map(|e| e.size_bytes(key)).unwrap_or(0);
        let used: usize = entries.iter().map(|(k, e)| e.size_bytes(k)).sum();
        let needed = used - replaced + entry.size_bytes(key);
        if needed > self.quota_bytes {
            return Err(CacheError::QuotaExceeded {
                needed,
                quota: self.quota_bytes,
            });
        }
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.write().shift_remove(key).is_some())
    }

    fn remove_expired(&self, key: &str, now_ms: i64) -> Result<bool, CacheError> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now_ms) => {
                entries.shift_remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.read().len())
    }

    fn oldest_key(&self) -> Result<Option<String>, CacheError> {
        Ok(self.entries.read().first().map(|(k, _)| k.clone()))
    }

    fn expired_keys(&self, now_ms: i64) -> Result<Vec<String>, CacheError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn used_bytes(&self) -> Result<usize, CacheError> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, e)| e.size_bytes(k))
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(payload: &str) -> StoredEntry {
        StoredEntry::new(payload.to_string(), Duration::from_secs(60))
    }

    #[test]
    fn memory_preserves_insertion_order_on_overwrite() {
        let backend = MemoryBackend::new();
        backend.store("a", entry("1")).unwrap();
        backend.store("b", entry("2")).unwrap();
        backend.store("a", entry("3")).unwrap();

        // "a" keeps its slot at the front
        assert_eq!(backend.oldest_key().unwrap().as_deref(), Some("a"));
        assert_eq!(backend.load("a").unwrap().unwrap().payload, "3");
    }

    #[test]
    fn session_rejects_over_quota_write() {
        let backend = SessionBackend::new(16);
        backend.store("k", entry("12345678")).unwrap(); // 1 + 8 = 9 bytes
        let err = backend.store("l", entry("12345678")).unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { needed: 18, quota: 16 }));
        // The original entry survives
        assert!(backend.load("k").unwrap().is_some());
    }

    #[test]
    fn session_overwrite_accounts_for_replaced_bytes() {
        let backend = SessionBackend::new(16);
        backend.store("k", entry("12345678")).unwrap();
        // Same key: the old 9 bytes are released before accounting
        backend.store("k", entry("123456789012345")).unwrap();
    }

    #[test]
    fn remove_expired_spares_entries_refreshed_after_a_scan() {
        let backend = MemoryBackend::new();
        backend
            .store(
                "a",
                StoredEntry::with_created_at("x".into(), 0, Duration::from_millis(10)),
            )
            .unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(backend.expired_keys(now).unwrap(), vec!["a".to_string()]);

        // A writer refreshes the key between the scan and the delete
        backend.store("a", entry("fresh")).unwrap();
        assert!(!backend.remove_expired("a", now).unwrap());
        assert_eq!(backend.load("a").unwrap().unwrap().payload, "fresh");
    }

    #[test]
    fn expired_keys_reports_only_expired() {
        let backend = MemoryBackend::new();
        backend
            .store(
                "old",
                StoredEntry::with_created_at("x".into(), 0, Duration::from_millis(10)),
            )
            .unwrap();
        backend.store("fresh", entry("y")).unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(backend.expired_keys(now).unwrap(), vec!["old".to_string()]);
    }
}
