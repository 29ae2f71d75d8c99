//! Cache service facade
//!
//! Uniform get/set/delete/clear across the three tiers, a read-through
//! `get_or_set`, and the periodic sweep task. Tier operations are
//! independent: there is no cross-tier transaction, and each tier is
//! consistent only with itself.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{MemoryBackend, SessionBackend};
use crate::durable::DurableBackend;
use crate::error::CacheError;
use crate::tier::Tier;

/// Which storage tier an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// In-process map, bounded by entry count
    Memory,
    /// SQLite-backed store, survives restarts
    Durable,
    /// Process-lifetime store with a byte quota
    Session,
}

/// Configuration for [`CacheService`]
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when a write does not specify one
    pub default_ttl: Duration,
    /// Entry-count bound for the memory tier
    pub memory_capacity: usize,
    /// Cadence of the background sweep
    pub sweep_interval: Duration,
    /// Database file for the durable tier; None keeps it in memory
    pub durable_path: Option<PathBuf>,
    pub durable_quota_bytes: usize,
    pub session_quota_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            memory_capacity: 500,
            sweep_interval: Duration::from_secs(60),
            durable_path: None,
            durable_quota_bytes: 5 * 1024 * 1024,
            session_quota_bytes: 1024 * 1024,
        }
    }
}

struct CacheInner {
    memory: Tier<MemoryBackend>,
    durable: Tier<DurableBackend>,
    session: Tier<SessionBackend>,
    sweep_interval: Duration,
}

/// Layered cache over memory, durable, and session tiers. Cheap to clone;
/// clones share the underlying stores.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<CacheInner>,
}

impl CacheService {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let durable_backend = match &config.durable_path {
            Some(path) => DurableBackend::open(path, config.durable_quota_bytes)?,
            None => DurableBackend::open_in_memory(config.durable_quota_bytes)?,
        };

        Ok(Self {
            inner: Arc::new(CacheInner {
                memory: Tier::with_capacity(
                    MemoryBackend::new(),
                    config.default_ttl,
                    config.memory_capacity,
                ),
                durable: Tier::new(durable_backend, config.default_ttl),
                session: Tier::new(
                    SessionBackend::new(config.session_quota_bytes),
                    config.default_ttl,
                ),
                sweep_interval: config.sweep_interval,
            }),
        })
    }

    /// Write `value` into one tier with `ttl ?? default_ttl`
    pub fn set<T: Serialize>(
        &self,
        tier: CacheTier,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        match tier {
            CacheTier::Memory => self.inner.memory.set(key, value, ttl),
            CacheTier::Durable => self.inner.durable.set(key, value, ttl),
            CacheTier::Session => self.inner.session.set(key, value, ttl),
        }
    }

    /// Read from one tier; expired entries read as misses
    pub fn get<T: DeserializeOwned>(&self, tier: CacheTier, key: &str) -> Option<T> {
        match tier {
            CacheTier::Memory => self.inner.memory.get(key),
            CacheTier::Durable => self.inner.durable.get(key),
            CacheTier::Session => self.inner.session.get(key),
        }
    }

    /// Remove one entry; true if it was present
    pub fn delete(&self, tier: CacheTier, key: &str) -> Result<bool, CacheError> {
        match tier {
            CacheTier::Memory => self.inner.memory.delete(key),
            CacheTier::Durable => self.inner.durable.delete(key),
            CacheTier::Session => self.inner.session.delete(key),
        }
    }

    pub fn clear(&self, tier: CacheTier) -> Result<(), CacheError> {
        match tier {
            CacheTier::Memory => self.inner.memory.clear(),
            CacheTier::Durable => self.inner.durable.clear(),
            CacheTier::Session => self.inner.session.clear(),
        }
    }

    pub fn clear_all(&self) -> Result<(), CacheError> {
        self.inner.memory.clear()?;
        self.inner.durable.clear()?;
        self.inner.session.clear()
    }

    /// Read-through: return the cached value, or produce, store, and return
    /// a fresh one.
    ///
    /// The producer is the only failure surface callers must handle: its
    /// error propagates as [`CacheError::Producer`] and nothing is written.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        tier: CacheTier,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(cached) = self.get(tier, key) {
            debug!(key, ?tier, "cache hit");
            return Ok(cached);
        }

        debug!(key, ?tier, "cache miss, producing");
        let value = producer().await.map_err(CacheError::Producer)?;
        self.set(tier, key, &value, ttl)?;
        Ok(value)
    }

    /// Sweep all tiers once, deleting expired entries
    pub fn sweep_now(&self) -> SweepStats {
        SweepStats {
            memory_removed: self.inner.memory.sweep(),
            durable_removed: self.inner.durable.sweep(),
            session_removed: self.inner.session.sweep(),
        }
    }

    /// Spawn the periodic sweep task. Runs until the handle is aborted or
    /// the runtime shuts down.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.sweep_interval;
        tokio::spawn(async move {
            info!(?period, "cache sweeper started");
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                let stats = cache.sweep_now();
                if stats.total() > 0 {
                    debug!(
                        memory = stats.memory_removed,
                        durable = stats.durable_removed,
                        session = stats.session_removed,
                        "sweep removed expired entries"
                    );
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.inner.memory.len(),
            durable_entries: self.inner.durable.len(),
            session_entries: self.inner.session.len(),
            memory_bytes: self.inner.memory.used_bytes(),
            durable_bytes: self.inner.durable.used_bytes(),
            session_bytes: self.inner.session.used_bytes(),
        }
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("CacheService")
            .field("memory_entries", &stats.memory_entries)
            .field("durable_entries", &stats.durable_entries)
            .field("session_entries", &stats.session_entries)
            .finish()
    }
}

/// Entries removed by one sweep pass
#[derive(Debug, Clone, Copy)]
pub struct SweepStats {
    pub memory_removed: usize,
    pub durable_removed: usize,
    pub session_removed: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.memory_removed + self.durable_removed + self.session_removed
    }
}

/// Current cache occupancy
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub durable_entries: usize,
    pub session_entries: usize,
    pub memory_bytes: usize,
    pub durable_bytes: usize,
    pub session_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> CacheService {
        CacheService::new(CacheConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn set_get_roundtrip_on_every_tier() {
        let cache = service();
        for tier in [CacheTier::Memory, CacheTier::Durable, CacheTier::Session] {
            cache
                .set(tier, "px:BTCUSDT", &json!({"price": 65000}), None)
                .unwrap();
            let value: Value = cache.get(tier, "px:BTCUSDT").unwrap();
            assert_eq!(value, json!({"price": 65000}));
        }
    }

    #[tokio::test]
    async fn expiry_is_per_tier() {
        let cache = service();
        cache
            .set(CacheTier::Memory, "k", &json!(1), Some(Duration::from_millis(20)))
            .unwrap();
        cache.set(CacheTier::Session, "k", &json!(1), None).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get::<Value>(CacheTier::Memory, "k").is_none());
        assert!(cache.get::<Value>(CacheTier::Session, "k").is_some());
    }

    #[tokio::test]
    async fn get_or_set_produces_once_on_miss() {
        let cache = service();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let value: Value = cache
            .get_or_set(CacheTier::Memory, "chart:BTC:1h", None, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"bars": 120}))
            })
            .await
            .unwrap();
        assert_eq!(value, json!({"bars": 120}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Hit: the producer must not run again
        let counter = Arc::clone(&calls);
        let value: Value = cache
            .get_or_set(CacheTier::Memory, "chart:BTC:1h", None, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"bars": 999}))
            })
            .await
            .unwrap();
        assert_eq!(value, json!({"bars": 120}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_producer_propagates_and_writes_nothing() {
        let cache = service();
        let result: Result<Value, _> = cache
            .get_or_set(CacheTier::Memory, "k", None, || async {
                Err(anyhow::anyhow!("backend unreachable"))
            })
            .await;

        assert!(matches!(result, Err(CacheError::Producer(_))));
        assert!(cache.get::<Value>(CacheTier::Memory, "k").is_none());

        // A later call with a working producer fills the entry
        let value: Value = cache
            .get_or_set(CacheTier::Memory, "k", None, || async { Ok(json!(42)) })
            .await
            .unwrap();
        assert_eq!(value, json!(42));
    }

    #[tokio::test]
    async fn sweep_purges_expired_entries_without_reads() {
        let cache = service();
        cache
            .set(CacheTier::Memory, "a", &json!(1), Some(Duration::from_millis(10)))
            .unwrap();
        cache
            .set(CacheTier::Durable, "b", &json!(2), Some(Duration::from_millis(10)))
            .unwrap();
        cache
            .set(CacheTier::Session, "c", &json!(3), Some(Duration::from_millis(10)))
            .unwrap();
        cache.set(CacheTier::Memory, "keep", &json!(4), None).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stats = cache.sweep_now();
        assert_eq!(stats.total(), 3);

        let occupancy = cache.stats();
        assert_eq!(occupancy.memory_entries, 1);
        assert_eq!(occupancy.durable_entries, 0);
        assert_eq!(occupancy.session_entries, 0);
    }

    #[tokio::test]
    async fn background_sweeper_runs_periodically() {
        let cache = CacheService::new(CacheConfig {
            sweep_interval: Duration::from_millis(40),
            ..Default::default()
        })
        .unwrap();
        let sweeper = cache.spawn_sweeper();

        cache
            .set(CacheTier::Memory, "k", &json!(1), Some(Duration::from_millis(15)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Entry was purged by the sweeper, not by a read
        assert_eq!(cache.stats().memory_entries, 0);
        sweeper.abort();
    }

    #[tokio::test]
    async fn tiers_are_independent() {
        let cache = service();
        cache.set(CacheTier::Memory, "k", &json!("mem"), None).unwrap();
        cache.set(CacheTier::Durable, "k", &json!("disk"), None).unwrap();

        cache.clear(CacheTier::Memory).unwrap();
        assert!(cache.get::<Value>(CacheTier::Memory, "k").is_none());
        assert_eq!(cache.get::<Value>(CacheTier::Durable, "k"), Some(json!("disk")));

        assert!(cache.delete(CacheTier::Durable, "k").unwrap());
        assert!(!cache.delete(CacheTier::Durable, "k").unwrap());
    }
}
