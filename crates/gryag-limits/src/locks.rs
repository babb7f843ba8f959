//! Per-chat serialization locks.
//!
//! A map from `(chat_id, thread_id, user_id)` to an async mutex. The pipeline
//! holds the lock through reply-send so two messages from the same sender in
//! the same thread are processed strictly in order. Idle entries are
//! garbage-collected periodically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

type LockKey = (i64, Option<i64>, i64);

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    last_used: Instant,
}

pub struct ChatLocks {
    entries: DashMap<LockKey, LockEntry>,
    idle_ttl: Duration,
}

impl ChatLocks {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_ttl,
        }
    }

    /// Fetch (or create) the lock for a sender triplet. The caller awaits
    /// `.lock()` on the returned mutex.
    pub fn acquire(&self, chat_id: i64, thread_id: Option<i64>, user_id: i64) -> Arc<Mutex<()>> {
        let key = (chat_id, thread_id, user_id);
        let mut entry = self.entries.entry(key).or_insert_with(|| LockEntry {
            mutex: Arc::new(Mutex::new(())),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        Arc::clone(&entry.mutex)
    }

    /// Drop idle, uncontended entries. Returns the number removed.
    pub fn gc(&self) -> usize {
        let ttl = self.idle_ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            // Strong count 1 means only the map holds it — safe to drop.
            entry.last_used.elapsed() < ttl || Arc::strong_count(&entry.mutex) > 1
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "collected idle chat locks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_triplet_serialises() {
        let locks = ChatLocks::new(Duration::from_secs(60));
        let lock = locks.acquire(-100, None, 42);
        let guard = lock.lock().await;
        // Same triplet yields the same mutex — a second lock would block.
        let again = locks.acquire(-100, None, 42);
        assert!(again.try_lock().is_err());
        drop(guard);
        assert!(again.try_lock().is_ok());
    }

    #[tokio::test]
    async fn different_threads_do_not_contend() {
        let locks = ChatLocks::new(Duration::from_secs(60));
        let a = locks.acquire(-100, None, 42);
        let b = locks.acquire(-100, Some(7), 42);
        let c = locks.acquire(-100, None, 43);
        let _ga = a.lock().await;
        assert!(b.try_lock().is_ok());
        assert!(c.try_lock().is_ok());
    }

    #[tokio::test]
    async fn gc_drops_idle_entries_only() {
        let locks = ChatLocks::new(Duration::from_millis(1));
        let held = locks.acquire(-100, None, 1);
        let _guard = held.lock().await;
        locks.acquire(-100, None, 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.gc();
        // The held lock survives (strong count > 1); the idle one is gone.
        assert_eq!(locks.len(), 1);
    }
}
