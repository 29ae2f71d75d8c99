//! Layered TTL cache for the desk client
//!
//! Three tiers behind one facade: a count-bounded in-process map, a
//! SQLite-backed durable store, and a quota-bounded session store. All
//! tiers share the same policy ([`tier::Tier`]): lazy expiry on read,
//! insertion-order eviction, and selective eviction on quota pressure.
//! [`CacheService::get_or_set`] is the read-through entry point; a
//! background sweeper purges expired entries that nothing reads.

pub mod backend;
pub mod durable;
pub mod entry;
pub mod error;
pub mod service;
pub mod tier;

pub use backend::{MemoryBackend, SessionBackend, StoreBackend};
pub use durable::DurableBackend;
pub use entry::StoredEntry;
pub use error::CacheError;
pub use service::{CacheConfig, CacheService, CacheStats, CacheTier, SweepStats};
pub use tier::Tier;
