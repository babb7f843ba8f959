use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tracing::warn;

use gryag_core::telemetry;
use gryag_core::{GryagError, Result};

/// Retry schedule for SQLITE_BUSY / SQLITE_LOCKED.
const BUSY_RETRY_DELAYS_MS: [u64; 3] = [50, 100, 200];

/// Shared handle to the embedded database.
///
/// Cheap to clone. All access goes through [`Storage::with_conn`], which
/// serialises writers through the mutex and retries lock contention with
/// bounded backoff.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the database file and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init(conn, busy_timeout_ms)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn, 1000)
    }

    fn init(conn: Connection, busy_timeout_ms: u64) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(storage_err)?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .map_err(storage_err)?;
        crate::schema::bootstrap(&conn).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection, retrying on lock contention.
    ///
    /// Failures map to `storage_error` and bump the `storage_errors` counter;
    /// they are never swallowed here.
    pub fn with_conn<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut last_err: Option<rusqlite::Error> = None;
        for (attempt, delay_ms) in std::iter::once(0u64)
            .chain(BUSY_RETRY_DELAYS_MS.iter().copied())
            .enumerate()
        {
            if delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(delay_ms));
            }
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) => {
                    warn!(attempt, error = %e, "database busy, retrying");
                    last_err = Some(e);
                }
                Err(e) => {
                    telemetry::incr("storage_errors");
                    return Err(storage_err(e));
                }
            }
        }
        telemetry::incr("storage_errors");
        Err(storage_err(last_err.expect("at least one busy attempt recorded")))
    }

    /// Run `f` inside a transaction. The closure sees the same connection;
    /// any error rolls the transaction back.
    pub fn with_tx<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            match f(conn) {
                Ok(v) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(v)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
    }

    /// Size of the database file in bytes (0 for in-memory).
    pub fn size_bytes(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let page_count: u64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let page_size: u64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
            Ok(page_count * page_size)
        })
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn storage_err(e: rusqlite::Error) -> GryagError {
    GryagError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_bootstraps_schema() {
        let storage = Storage::open_in_memory().unwrap();
        let n: i64 = storage
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM turns", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn bootstrap_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gryag.db");
        drop(Storage::open(&path, 1000).unwrap());
        // Re-opening the same file must not fail or duplicate anything.
        let storage = Storage::open(&path, 1000).unwrap();
        storage
            .with_conn(|c| c.execute("INSERT INTO bans (chat_id, user_id, created_at) VALUES (1, 2, 0)", []))
            .unwrap();
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let storage = Storage::open_in_memory().unwrap();
        let res: Result<()> = storage.with_tx(|c| {
            c.execute(
                "INSERT INTO bans (chat_id, user_id, created_at) VALUES (5, 6, 0)",
                [],
            )?;
            Err(rusqlite::Error::InvalidQuery)
        });
        assert!(res.is_err());
        let n: i64 = storage
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM bans", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn storage_error_maps_to_taxonomy() {
        let storage = Storage::open_in_memory().unwrap();
        let err = storage
            .with_conn(|c| c.execute("INSERT INTO no_such_table VALUES (1)", []))
            .unwrap_err();
        assert_eq!(err.code(), "storage_error");
    }
}
