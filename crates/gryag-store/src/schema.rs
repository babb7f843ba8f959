//! Idempotent schema bootstrap plus forward-compatible migrations.
//!
//! Timestamps are seconds since epoch (INTEGER). Embeddings and media are
//! JSON in TEXT columns. Turn text is indexed by an external-content FTS5
//! table that callers sync manually on write and delete.

use rusqlite::{Connection, Result};
use tracing::info;

/// Create every table if missing, then apply add-column migrations.
/// Safe to call on every startup.
pub fn bootstrap(conn: &Connection) -> Result<()> {
    create_turns(conn)?;
    create_facts(conn)?;
    create_episodes(conn)?;
    create_profiles(conn)?;
    create_bans(conn)?;
    create_embedding_cache(conn)?;
    create_quota_ledger(conn)?;
    create_prompt_overrides(conn)?;
    migrate(conn)?;
    Ok(())
}

fn create_turns(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS turns (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id        INTEGER NOT NULL,
            thread_id      INTEGER,
            message_id     INTEGER,
            user_id        INTEGER NOT NULL,
            role           TEXT NOT NULL,
            text           TEXT NOT NULL DEFAULT '',
            media          TEXT,
            embedding      TEXT,
            importance     REAL,
            ts             INTEGER NOT NULL,
            retention_days INTEGER NOT NULL DEFAULT 90
        );
        CREATE INDEX IF NOT EXISTS idx_turns_chat_ts
            ON turns(chat_id, thread_id, ts);
        CREATE INDEX IF NOT EXISTS idx_turns_message
            ON turns(chat_id, message_id);
        CREATE VIRTUAL TABLE IF NOT EXISTS turns_fts
            USING fts5(text, content='turns', content_rowid='id');",
    )
}

fn create_facts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS facts (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type    TEXT NOT NULL,
            entity_id      INTEGER NOT NULL,
            chat_context   TEXT NOT NULL DEFAULT 'global',
            category       TEXT NOT NULL,
            key            TEXT NOT NULL,
            value          TEXT NOT NULL,
            value_norm     TEXT NOT NULL,
            confidence     REAL NOT NULL DEFAULT 0.8,
            evidence       TEXT,
            source_turn_id INTEGER,
            is_active      INTEGER NOT NULL DEFAULT 1,
            evidence_count INTEGER NOT NULL DEFAULT 1,
            embedding      TEXT,
            created_at     INTEGER NOT NULL,
            updated_at     INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_facts_entity
            ON facts(entity_type, entity_id, chat_context, category, key);
        CREATE INDEX IF NOT EXISTS idx_facts_source_turn
            ON facts(source_turn_id);
        CREATE TABLE IF NOT EXISTS fact_versions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            fact_id     INTEGER NOT NULL,
            change_type TEXT NOT NULL,
            value       TEXT,
            confidence  REAL,
            reason      TEXT,
            created_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fact_versions_fact
            ON fact_versions(fact_id, created_at);",
    )
}

fn create_episodes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS episodes (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id           INTEGER NOT NULL,
            thread_id         INTEGER,
            start_turn_id     INTEGER NOT NULL,
            end_turn_id       INTEGER NOT NULL,
            participants      TEXT NOT NULL DEFAULT '[]',
            summary           TEXT NOT NULL DEFAULT '',
            topic             TEXT NOT NULL DEFAULT '',
            tags              TEXT NOT NULL DEFAULT '[]',
            importance        REAL NOT NULL DEFAULT 0.5,
            emotional_valence TEXT NOT NULL DEFAULT 'neutral',
            created_at        INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_chat
            ON episodes(chat_id, thread_id, end_turn_id);",
    )
}

fn create_profiles(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_profiles (
            user_id            INTEGER NOT NULL,
            chat_id            INTEGER NOT NULL,
            display_name       TEXT,
            username           TEXT,
            pronouns           TEXT,
            membership         TEXT NOT NULL DEFAULT 'member',
            interaction_count  INTEGER NOT NULL DEFAULT 0,
            last_seen          INTEGER NOT NULL DEFAULT 0,
            summary            TEXT,
            summary_updated_at INTEGER,
            PRIMARY KEY (user_id, chat_id)
        );
        CREATE TABLE IF NOT EXISTS chat_profiles (
            chat_id            INTEGER PRIMARY KEY,
            title              TEXT,
            interaction_count  INTEGER NOT NULL DEFAULT 0,
            last_seen          INTEGER NOT NULL DEFAULT 0,
            summary            TEXT,
            summary_updated_at INTEGER
        );",
    )
}

fn create_bans(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS bans (
            chat_id    INTEGER NOT NULL,
            user_id    INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (chat_id, user_id)
        );",
    )
}

fn create_embedding_cache(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS embedding_cache (
            text_hash    TEXT PRIMARY KEY,
            embedding    TEXT NOT NULL,
            last_access  INTEGER NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 1
        );",
    )
}

fn create_quota_ledger(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS quota_ledger (
            user_id      INTEGER NOT NULL,
            feature      TEXT NOT NULL,
            window_kind  TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            count        INTEGER NOT NULL DEFAULT 0,
            last_request INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, feature, window_kind, window_start)
        );
        CREATE TABLE IF NOT EXISTS user_reputation (
            user_id    INTEGER PRIMARY KEY,
            score      REAL NOT NULL DEFAULT 1.0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );",
    )
}

fn create_prompt_overrides(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS prompt_overrides (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            scope       TEXT NOT NULL,
            chat_id     INTEGER,
            admin_id    INTEGER NOT NULL,
            version     INTEGER NOT NULL,
            prompt_text TEXT NOT NULL,
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_prompt_overrides_scope
            ON prompt_overrides(scope, chat_id, version);",
    )
}

/// Forward-compatible alters for databases created by older builds.
fn migrate(conn: &Connection) -> Result<()> {
    ensure_column(conn, "turns", "embedding", "TEXT")?;
    ensure_column(conn, "turns", "importance", "REAL")?;
    ensure_column(conn, "turns", "retention_days", "INTEGER NOT NULL DEFAULT 90")?;
    ensure_column(conn, "facts", "embedding", "TEXT")?;
    ensure_column(conn, "facts", "evidence_count", "INTEGER NOT NULL DEFAULT 1")?;
    ensure_column(conn, "facts", "source_turn_id", "INTEGER")?;
    ensure_column(conn, "user_profiles", "pronouns", "TEXT")?;
    Ok(())
}

/// Add a column if the table does not have it yet.
fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .any(|name| name == column);
    if !exists {
        info!(table, column, "adding missing column");
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();
        conn
    }

    #[test]
    fn bootstrap_twice_is_idempotent() {
        let conn = fresh();
        bootstrap(&conn).unwrap();
    }

    #[test]
    fn fts_table_tracks_turns() {
        let conn = fresh();
        conn.execute(
            "INSERT INTO turns (chat_id, user_id, role, text, ts) VALUES (1, 2, 'user', 'hello world', 0)",
            [],
        )
        .unwrap();
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO turns_fts(rowid, text) VALUES (?1, 'hello world')",
            [id],
        )
        .unwrap();
        let hit: i64 = conn
            .query_row(
                "SELECT rowid FROM turns_fts WHERE turns_fts MATCH 'hello'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hit, id);
    }

    #[test]
    fn ensure_column_adds_once() {
        let conn = fresh();
        ensure_column(&conn, "bans", "note", "TEXT").unwrap();
        ensure_column(&conn, "bans", "note", "TEXT").unwrap();
        conn.execute(
            "INSERT INTO bans (chat_id, user_id, created_at, note) VALUES (1, 2, 0, 'x')",
            [],
        )
        .unwrap();
    }
}
