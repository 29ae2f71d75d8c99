//! Cache entry with TTL metadata

use chrono::Utc;
use std::time::Duration;

/// One cached record as held by a storage backend. The payload is the
/// JSON-serialized value; TTL bookkeeping lives here so every backend
/// stores the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub payload: String,
    /// Wall-clock creation time, epoch milliseconds
    pub created_at_ms: i64,
    pub ttl_ms: i64,
}

impl StoredEntry {
    pub fn new(payload: String, ttl: Duration) -> Self {
        Self {
            payload,
            created_at_ms: Utc::now().timestamp_millis(),
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_created_at(payload: String, created_at_ms: i64, ttl: Duration) -> Self {
        Self {
            payload,
            created_at_ms,
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    /// An entry is logically expired once `now` is strictly past
    /// `created_at + ttl`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.created_at_ms + self.ttl_ms
    }

    /// Bytes this entry accounts for against a backend quota
    pub fn size_bytes(&self, key: &str) -> usize {
        key.len() + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_boundary_is_exclusive() {
        let entry = StoredEntry::with_created_at("{}".into(), 1_000, Duration::from_millis(500));
        assert!(!entry.is_expired(1_000));
        assert!(!entry.is_expired(1_500));
        assert!(entry.is_expired(1_501));
    }

    #[test]
    fn size_counts_key_and_payload() {
        let entry = StoredEntry::with_created_at("abcd".into(), 0, Duration::from_secs(1));
        assert_eq!(entry.size_bytes("kk"), 6);
    }
}
