//! Errors from cache operations

/// Errors from cache operations
///
/// Only `Producer` reaches callers in the normal read/write paths: reads
/// absorb failures into misses, and quota errors are handled inside the
/// write path by eviction.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage quota exceeded: need {needed} bytes, quota is {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("Producer error: {0}")]
    Producer(anyhow::Error),
}
