//! SQLite-backed durable tier
//!
//! Entries survive process restarts. The backend enforces a byte quota the
//! same way the in-process session store does; quota recovery (selective
//! eviction) happens at the policy layer.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::backend::StoreBackend;
use crate::entry::StoredEntry;
use crate::error::CacheError;

/// Durable key-value store over an embedded SQLite database
pub struct DurableBackend {
    db: Mutex<Connection>,
    quota_bytes: usize,
}

impl DurableBackend {
    pub fn open<P: AsRef<Path>>(path: P, quota_bytes: usize) -> Result<Self, CacheError> {
        Self::init(Connection::open(path)?, quota_bytes)
    }

    /// In-memory database; used by tests and by callers that want the
    /// durable tier semantics without a file on disk
    pub fn open_in_memory(quota_bytes: usize) -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?, quota_bytes)
    }

    fn init(conn: Connection, quota_bytes: usize) -> Result<Self, CacheError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                ttl_ms INTEGER NOT NULL,
                inserted_seq INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cache_entries_seq
            ON cache_entries(inserted_seq);
            "#,
        )?;
        Ok(Self {
            db: Mutex::new(conn),
            quota_bytes,
        })
    }
}

impl StoreBackend for DurableBackend {
    fn name(&self) -> &'static str {
        "durable"
    }

    fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT payload, created_at, ttl_ms FROM cache_entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok(StoredEntry {
                        payload: row.get(0)?,
                        created_at_ms: row.get(1)?,
                        ttl_ms: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn store(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let conn = self.db.lock();

        let replaced: usize = conn
            .query_row(
                "SELECT LENGTH(key) + LENGTH(payload) FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0) as usize;
        let used: usize = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(payload)), 0) FROM cache_entries",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;

        let needed = used - replaced + entry.size_bytes(key);
        if needed > self.quota_bytes {
            return Err(CacheError::QuotaExceeded {
                needed,
                quota: self.quota_bytes,
            });
        }

        // Overwrites keep their original insertion slot, matching the
        // in-process backends
        conn.execute(
            r#"
            INSERT INTO cache_entries (key, payload, created_at, ttl_ms, inserted_seq)
            VALUES (
                ?1, ?2, ?3, ?4,
                COALESCE(
                    (SELECT inserted_seq FROM cache_entries WHERE key = ?1),
                    (SELECT COALESCE(MAX(inserted_seq), 0) + 1 FROM cache_entries)
                )
            )
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                ttl_ms = excluded.ttl_ms
            "#,
            params![key, entry.payload, entry.created_at_ms, entry.ttl_ms],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let conn = self.db.lock();
        let affected = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    fn remove_expired(&self, key: &str, now_ms: i64) -> Result<bool, CacheError> {
        let conn = self.db.lock();
        let affected = conn.execute(
            "DELETE FROM cache_entries WHERE key = ?1 AND created_at + ttl_ms < ?2",
            params![key, now_ms],
        )?;
        Ok(affected > 0)
    }

    fn clear(&self) -> Result<(), CacheError> {
        let conn = self.db.lock();
        conn.execute("DELETE FROM cache_entries", [])?;
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn oldest_key(&self) -> Result<Option<String>, CacheError> {
        let conn = self.db.lock();
        let key = conn
            .query_row(
                "SELECT key FROM cache_entries ORDER BY inserted_seq ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    fn expired_keys(&self, now_ms: i64) -> Result<Vec<String>, CacheError> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM cache_entries WHERE created_at + ttl_ms < ?1")?;
        let keys = stmt
            .query_map(params![now_ms], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn used_bytes(&self) -> Result<usize, CacheError> {
        let conn = self.db.lock();
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(payload)), 0) FROM cache_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(used as usize)
    }
}

impl std::fmt::Debug for DurableBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBackend")
            .field("quota_bytes", &self.quota_bytes)
            .finish()
    }
}
