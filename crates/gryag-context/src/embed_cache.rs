//! Content-addressed embedding cache.
//!
//! Keys are `sha256(text)` hex digests. An in-memory LRU fronts a durable
//! `embedding_cache` table (write-through); the durable side is pruned by
//! `last_access` beyond capacity. Hits and misses feed telemetry so the
//! resource monitor can report cache effectiveness.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use gryag_core::{telemetry, Result};
use gryag_store::Storage;

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct EmbeddingCache {
    storage: Storage,
    lru: Mutex<LruCache<String, Vec<f32>>>,
    capacity: usize,
}

impl EmbeddingCache {
    pub fn new(storage: Storage, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            storage,
            lru: Mutex::new(LruCache::new(cap)),
            capacity,
        }
    }

    pub fn key(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    /// Look up an embedding. A hit bumps the durable access stats.
    pub fn get(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let key = Self::key(text);

        if let Some(hit) = self.lru.lock().expect("lru poisoned").get(&key).cloned() {
            telemetry::incr("cache_hits");
            self.touch(&key)?;
            return Ok(Some(hit));
        }

        let durable: Option<Vec<f32>> = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT embedding FROM embedding_cache WHERE text_hash = ?1",
                [&key],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })?
        .and_then(|json| serde_json::from_str(&json).ok());

        match durable {
            Some(vector) => {
                telemetry::incr("cache_hits");
                self.touch(&key)?;
                self.lru
                    .lock()
                    .expect("lru poisoned")
                    .put(key, vector.clone());
                Ok(Some(vector))
            }
            None => {
                telemetry::incr("cache_misses");
                Ok(None)
            }
        }
    }

    /// Store an embedding (write-through) and prune the durable overflow.
    pub fn put(&self, text: &str, vector: &[f32]) -> Result<()> {
        let key = Self::key(text);
        let json = serde_json::to_string(vector).unwrap_or_default();
        let now = chrono::Utc::now().timestamp();

        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO embedding_cache (text_hash, embedding, last_access, access_count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(text_hash) DO UPDATE SET
                    embedding = excluded.embedding,
                    last_access = excluded.last_access,
                    access_count = access_count + 1",
                params![key, json, now],
            )?;
            Ok(())
        })?;
        self.lru
            .lock()
            .expect("lru poisoned")
            .put(key, vector.to_vec());
        telemetry::incr("cache_stores");
        self.prune_durable()?;
        Ok(())
    }

    fn touch(&self, key: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.storage.with_conn(|conn| {
            conn.execute(
                "UPDATE embedding_cache
                 SET last_access = ?1, access_count = access_count + 1
                 WHERE text_hash = ?2",
                params![now, key],
            )?;
            Ok(())
        })
    }

    /// Drop the least-recently-used durable rows beyond capacity.
    fn prune_durable(&self) -> Result<()> {
        let capacity = self.capacity as i64;
        self.storage.with_conn(|conn| {
            conn.execute(
                "DELETE FROM embedding_cache WHERE text_hash IN (
                    SELECT text_hash FROM embedding_cache
                    ORDER BY last_access DESC
                    LIMIT -1 OFFSET ?1
                 )",
                [capacity],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> EmbeddingCache {
        EmbeddingCache::new(Storage::open_in_memory().unwrap(), capacity)
    }

    #[test]
    fn miss_then_hit() {
        let cache = cache(10);
        let before_hits = telemetry::get("cache_hits");
        assert!(cache.get("hello").unwrap().is_none());
        cache.put("hello", &[0.5, 0.25]).unwrap();
        let got = cache.get("hello").unwrap().unwrap();
        assert_eq!(got, vec![0.5, 0.25]);
        assert!(telemetry::get("cache_hits") > before_hits);
    }

    #[test]
    fn survives_lru_eviction_via_durable_backing() {
        let cache = cache(1);
        cache.put("first", &[1.0]).unwrap();
        cache.put("second", &[2.0]).unwrap();
        // "first" was evicted from the in-memory LRU but capacity pruning is
        // also 1 — only the newest durable row remains.
        assert!(cache.get("second").unwrap().is_some());
    }

    #[test]
    fn durable_backing_serves_cold_process() {
        let storage = Storage::open_in_memory().unwrap();
        let warm = EmbeddingCache::new(storage.clone(), 10);
        warm.put("persisted", &[0.1]).unwrap();
        // Fresh LRU over the same storage — simulates a restart.
        let cold = EmbeddingCache::new(storage, 10);
        assert_eq!(cold.get("persisted").unwrap().unwrap(), vec![0.1]);
    }

    #[test]
    fn access_count_accumulates() {
        let cache = cache(10);
        cache.put("counted", &[0.1]).unwrap();
        cache.get("counted").unwrap();
        cache.get("counted").unwrap();
        let count: i64 = cache
            .storage
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT access_count FROM embedding_cache WHERE text_hash = ?1",
                    [EmbeddingCache::key("counted")],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert!(count >= 3);
    }

    #[test]
    fn key_is_stable_sha256() {
        assert_eq!(EmbeddingCache::key("a"), EmbeddingCache::key("a"));
        assert_ne!(EmbeddingCache::key("a"), EmbeddingCache::key("b"));
        assert_eq!(EmbeddingCache::key("").len(), 64);
    }
}
