//! Append-only conversation log with media references, embeddings, and
//! retention pruning. Turn text is mirrored into an external-content FTS5
//! index that is synced manually on insert and delete.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use gryag_core::Result;
use gryag_store::Storage;

use crate::types::{MediaPart, NewTurn, Role, Turn};

/// Turns scoring at or above this importance survive retention pruning.
const IMPORTANCE_KEEP_THRESHOLD: f64 = 0.7;

#[derive(Clone)]
pub struct ContextStore {
    storage: Storage,
}

impl ContextStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Insert a turn and sync the FTS index. Returns the turn id.
    pub fn add_turn(&self, new: &NewTurn) -> Result<i64> {
        let media_json = if new.media.is_empty() {
            None
        } else {
            serde_json::to_string(&new.media).ok()
        };
        let embedding_json = new
            .embedding
            .as_ref()
            .and_then(|e| serde_json::to_string(e).ok());
        let importance = importance_score(&new.text, &new.media);

        self.storage.with_tx(|conn| {
            conn.execute(
                "INSERT INTO turns (chat_id, thread_id, message_id, user_id, role, text,
                        media, embedding, importance, ts, retention_days)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new.chat_id,
                    new.thread_id,
                    new.message_id,
                    new.user_id,
                    new.role.to_string(),
                    new.text,
                    media_json,
                    embedding_json,
                    importance,
                    new.ts,
                    new.retention_days,
                ],
            )?;
            let id = conn.last_insert_rowid();
            if !new.text.is_empty() {
                conn.execute(
                    "INSERT INTO turns_fts(rowid, text) VALUES (?1, ?2)",
                    params![id, new.text],
                )?;
            }
            Ok(id)
        })
    }

    /// Attach an embedding to an already-stored turn.
    pub fn set_embedding(&self, turn_id: i64, embedding: &[f32]) -> Result<()> {
        let json = serde_json::to_string(embedding).unwrap_or_default();
        self.storage.with_conn(|conn| {
            conn.execute(
                "UPDATE turns SET embedding = ?1 WHERE id = ?2",
                params![json, turn_id],
            )?;
            Ok(())
        })
    }

    /// Last `max_turns` turns in a chat/thread, oldest first.
    pub fn recent(&self, chat_id: i64, thread_id: Option<i64>, max_turns: usize) -> Result<Vec<Turn>> {
        let mut turns = self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, thread_id, message_id, user_id, role, text,
                        media, embedding, importance, ts, retention_days
                 FROM turns
                 WHERE chat_id = ?1 AND thread_id IS ?2
                 ORDER BY id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![chat_id, thread_id, max_turns as i64], row_to_turn)?;
            Ok(rows.filter_map(|r| r.ok()).collect::<Vec<Turn>>())
        })?;
        turns.reverse();
        Ok(turns)
    }

    /// Locate a stored turn by its platform message id.
    pub fn find_by_message_id(&self, chat_id: i64, message_id: i64) -> Result<Option<Turn>> {
        self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT id, chat_id, thread_id, message_id, user_id, role, text,
                        media, embedding, importance, ts, retention_days
                 FROM turns WHERE chat_id = ?1 AND message_id = ?2
                 ORDER BY id DESC LIMIT 1",
                params![chat_id, message_id],
                row_to_turn,
            )
            .optional()
        })
    }

    pub fn get_turns(&self, ids: &[i64]) -> Result<Vec<Turn>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let turn = self.storage.with_conn(|conn| {
                conn.query_row(
                    "SELECT id, chat_id, thread_id, message_id, user_id, role, text,
                            media, embedding, importance, ts, retention_days
                     FROM turns WHERE id = ?1",
                    [id],
                    row_to_turn,
                )
                .optional()
            })?;
            if let Some(t) = turn {
                out.push(t);
            }
        }
        Ok(out)
    }

    /// Turns with id greater than `after_id`, oldest first. Used by the
    /// episode monitor to examine the unsealed tail.
    pub fn turns_after(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Turn>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, thread_id, message_id, user_id, role, text,
                        media, embedding, importance, ts, retention_days
                 FROM turns
                 WHERE chat_id = ?1 AND thread_id IS ?2 AND id > ?3
                 ORDER BY id LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![chat_id, thread_id, after_id, limit as i64],
                row_to_turn,
            )?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Distinct chat/thread pairs with activity after `since_ts`.
    pub fn active_threads(&self, since_ts: i64) -> Result<Vec<(i64, Option<i64>)>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT chat_id, thread_id FROM turns WHERE ts > ?1",
            )?;
            let rows = stmt.query_map([since_ts], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Keyword candidates from the FTS index: (turn_id, score in [0,1]).
    ///
    /// FTS5 `rank` is negative bm25 (more negative = better); it is folded
    /// into [0,1) with r/(r+1).
    pub fn search_keyword(&self, chat_id: i64, query: &str, limit: usize) -> Result<Vec<(i64, f64)>> {
        let fts_query = fts_sanitize(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, f.rank
                 FROM turns_fts f JOIN turns t ON t.id = f.rowid
                 WHERE t.chat_id = ?1 AND turns_fts MATCH ?2
                 ORDER BY f.rank LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![chat_id, fts_query, limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let rank: f64 = row.get(1)?;
                let r = -rank;
                let score = if r > 0.0 { r / (r + 1.0) } else { 0.0 };
                Ok((id, score))
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Recent turns that carry embeddings: (id, embedding, ts).
    pub fn recent_embedded(&self, chat_id: i64, limit: usize) -> Result<Vec<(i64, Vec<f32>, i64)>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, embedding, ts FROM turns
                 WHERE chat_id = ?1 AND embedding IS NOT NULL
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![chat_id, limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let json: String = row.get(1)?;
                let ts: i64 = row.get(2)?;
                Ok((id, json, ts))
            })?;
            Ok(rows
                .filter_map(|r| r.ok())
                .filter_map(|(id, json, ts)| {
                    serde_json::from_str::<Vec<f32>>(&json).ok().map(|e| (id, e, ts))
                })
                .collect())
        })
    }

    /// Most recent turn ids with timestamps (temporal candidates).
    pub fn recent_ids(&self, chat_id: i64, limit: usize) -> Result<Vec<(i64, i64)>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ts FROM turns WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![chat_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Delete turns past their per-turn retention window.
    ///
    /// Protected: turns scoring above the importance threshold, turns an
    /// active fact points at through `source_turn_id`, and the unsealed tail
    /// of each chat/thread (ids above the episode watermark) so an episode is
    /// never summarised from a partially deleted range. Returns the number of
    /// deleted turns.
    pub fn prune_old(&self, now_ts: i64) -> Result<usize> {
        let deleted = self.storage.with_tx(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM turns
                 WHERE ts < ?1 - retention_days * 86400
                   AND (importance IS NULL OR importance < ?2)
                   AND id NOT IN (SELECT source_turn_id FROM facts
                                  WHERE is_active = 1 AND source_turn_id IS NOT NULL)
                   AND id <= (SELECT COALESCE(MAX(e.end_turn_id), 0)
                              FROM episodes e
                              WHERE e.chat_id = turns.chat_id
                                AND e.thread_id IS turns.thread_id)",
            )?;
            let ids: Vec<i64> = stmt
                .query_map(params![now_ts, IMPORTANCE_KEEP_THRESHOLD], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            for &id in &ids {
                conn.execute(
                    "INSERT INTO turns_fts(turns_fts, rowid, text)
                     SELECT 'delete', id, text FROM turns WHERE id = ?1 AND text != ''",
                    [id],
                )?;
                conn.execute("DELETE FROM turns WHERE id = ?1", [id])?;
            }
            Ok(ids.len())
        })?;
        if deleted > 0 {
            info!(deleted, "pruned old turns");
        }
        Ok(deleted)
    }

    // --- bans ---------------------------------------------------------------

    pub fn ban_user(&self, chat_id: i64, user_id: i64, now_ts: i64) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO bans (chat_id, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![chat_id, user_id, now_ts],
            )?;
            Ok(())
        })
    }

    pub fn unban_user(&self, chat_id: i64, user_id: i64) -> Result<bool> {
        self.storage.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM bans WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )?;
            Ok(n > 0)
        })
    }

    pub fn is_banned(&self, chat_id: i64, user_id: i64) -> Result<bool> {
        self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM bans WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n > 0)
        })
    }
}

/// Lightweight importance score in [0,1] over length, media, and fact density.
///
/// Long messages, messages with media, and messages carrying first-person
/// statements (likely fact-bearing) score higher and survive pruning.
fn importance_score(text: &str, media: &[MediaPart]) -> f64 {
    let words = text.split_whitespace().count();
    let length_score = (words as f64 / 100.0).min(1.0);
    let media_score = if media.is_empty() { 0.0 } else { 0.5 };
    let lower = text.to_lowercase();
    let fact_markers = ["i am", "i live", "my name", "я живу", "мене звати", "я з"];
    let fact_score = if fact_markers.iter().any(|m| lower.contains(m)) {
        0.6
    } else {
        0.0
    };
    let score = (0.4 * length_score + 0.3 * media_score + 0.3 * fact_score).min(1.0);
    debug!(words, score, "scored turn importance");
    score
}

/// Reduce free text to a safe FTS5 OR-query over its words.
fn fts_sanitize(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let role_str: String = row.get(5)?;
    let media_json: Option<String> = row.get(7)?;
    let embedding_json: Option<String> = row.get(8)?;
    Ok(Turn {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        thread_id: row.get(2)?,
        message_id: row.get(3)?,
        user_id: row.get(4)?,
        role: role_str.parse().unwrap_or(Role::User),
        text: row.get(6)?,
        media: media_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        embedding: embedding_json.and_then(|j| serde_json::from_str(&j).ok()),
        importance: row.get(9)?,
        ts: row.get(10)?,
        retention_days: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    fn store() -> ContextStore {
        ContextStore::new(Storage::open_in_memory().unwrap())
    }

    fn user_turn(chat_id: i64, user_id: i64, text: &str, ts: i64) -> NewTurn {
        NewTurn::text_only(chat_id, user_id, Role::User, text, ts)
    }

    #[test]
    fn add_and_recent_in_order() {
        let store = store();
        for i in 0..5 {
            store.add_turn(&user_turn(-100, 42, &format!("msg {i}"), i)).unwrap();
        }
        let recent = store.recent(-100, None, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].text, "msg 2");
        assert_eq!(recent[2].text, "msg 4");
    }

    #[test]
    fn threads_are_separate_partitions() {
        let store = store();
        let mut a = user_turn(-100, 42, "main", 1);
        a.thread_id = None;
        let mut b = user_turn(-100, 42, "topic", 2);
        b.thread_id = Some(7);
        store.add_turn(&a).unwrap();
        store.add_turn(&b).unwrap();
        assert_eq!(store.recent(-100, None, 10).unwrap().len(), 1);
        assert_eq!(store.recent(-100, Some(7), 10).unwrap().len(), 1);
    }

    #[test]
    fn media_and_embedding_round_trip() {
        let store = store();
        let mut turn = user_turn(-100, 42, "look", 1);
        turn.media = vec![MediaPart::inline(MediaKind::Image, "image/png", "AAAA")];
        turn.embedding = Some(vec![0.1, 0.2]);
        let id = store.add_turn(&turn).unwrap();
        let got = store.get_turns(&[id]).unwrap().remove(0);
        assert_eq!(got.media.len(), 1);
        assert_eq!(got.media[0].mime, "image/png");
        assert_eq!(got.embedding.unwrap().len(), 2);
    }

    #[test]
    fn keyword_search_hits_and_scores() {
        let store = store();
        store.add_turn(&user_turn(-100, 42, "the weather in kyiv is nice", 1)).unwrap();
        store.add_turn(&user_turn(-100, 42, "unrelated chatter", 2)).unwrap();
        let hits = store.search_keyword(-100, "weather kyiv", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].1 > 0.0 && hits[0].1 < 1.0);
    }

    #[test]
    fn keyword_search_ignores_punctuation() {
        let store = store();
        store.add_turn(&user_turn(-100, 42, "deploy failed again", 1)).unwrap();
        let hits = store.search_keyword(-100, "deploy?! (failed)", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn find_by_message_id() {
        let store = store();
        let mut turn = user_turn(-100, 42, "original", 1);
        turn.message_id = Some(777);
        store.add_turn(&turn).unwrap();
        let found = store.find_by_message_id(-100, 777).unwrap().unwrap();
        assert_eq!(found.text, "original");
        assert!(store.find_by_message_id(-100, 778).unwrap().is_none());
    }

    #[test]
    fn bans_round_trip() {
        let store = store();
        assert!(!store.is_banned(-100, 42).unwrap());
        store.ban_user(-100, 42, 0).unwrap();
        assert!(store.is_banned(-100, 42).unwrap());
        assert!(store.unban_user(-100, 42).unwrap());
        assert!(!store.is_banned(-100, 42).unwrap());
        assert!(!store.unban_user(-100, 42).unwrap());
    }

    #[test]
    fn prune_respects_retention_and_importance() {
        let store = store();
        let now = 100 * 86400;

        // Old throwaway turn — should be pruned.
        let mut old = user_turn(-100, 42, "old filler", 0);
        old.retention_days = 10;
        let old_id = store.add_turn(&old).unwrap();

        // Old but important (fact-bearing, long) — survives.
        let mut important = user_turn(
            -100,
            42,
            &format!("my name is Taras and I live in Kyiv {}", "word ".repeat(120)),
            0,
        );
        important.retention_days = 10;
        let important_id = store.add_turn(&important).unwrap();

        // Fresh turn — survives.
        let fresh_id = store.add_turn(&user_turn(-100, 42, "fresh", now - 10)).unwrap();

        // Seal everything into an episode so the unsealed-tail guard passes.
        store
            .storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO episodes (chat_id, thread_id, start_turn_id, end_turn_id, created_at)
                     VALUES (-100, NULL, ?1, ?2, 0)",
                    params![old_id, fresh_id],
                )
            })
            .unwrap();

        let deleted = store.prune_old(now).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_turns(&[old_id]).unwrap().is_empty());
        assert_eq!(store.get_turns(&[important_id, fresh_id]).unwrap().len(), 2);
    }

    #[test]
    fn prune_keeps_turns_referenced_by_active_facts() {
        let store = store();
        let now = 100 * 86400;

        // Two old, low-importance turns sealed into an episode.
        let mut cited = user_turn(-100, 42, "kyiv", 0);
        cited.retention_days = 10;
        let cited_id = store.add_turn(&cited).unwrap();
        let mut uncited = user_turn(-100, 42, "ok", 0);
        uncited.retention_days = 10;
        let uncited_id = store.add_turn(&uncited).unwrap();
        store
            .storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO episodes (chat_id, thread_id, start_turn_id, end_turn_id, created_at)
                     VALUES (-100, NULL, ?1, ?2, 0)",
                    params![cited_id, uncited_id],
                )
            })
            .unwrap();

        // An active fact cites the first turn as its evidence.
        store
            .storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO facts (entity_type, entity_id, chat_context, category, key,
                            value, value_norm, confidence, source_turn_id, created_at, updated_at)
                     VALUES ('user', 42, '-100', 'preference', 'location',
                            'kyiv', 'kyiv', 0.9, ?1, 0, 0)",
                    params![cited_id],
                )
            })
            .unwrap();

        assert_eq!(store.prune_old(now).unwrap(), 1);
        assert_eq!(store.get_turns(&[cited_id]).unwrap().len(), 1);
        assert!(store.get_turns(&[uncited_id]).unwrap().is_empty());

        // Soft-deleting the fact releases the turn.
        store
            .storage
            .with_conn(|conn| conn.execute("UPDATE facts SET is_active = 0", []))
            .unwrap();
        assert_eq!(store.prune_old(now).unwrap(), 1);
        assert!(store.get_turns(&[cited_id]).unwrap().is_empty());
    }

    #[test]
    fn prune_never_touches_unsealed_tail() {
        let store = store();
        let now = 100 * 86400;
        let mut old = user_turn(-100, 42, "old but unsealed", 0);
        old.retention_days = 10;
        let id = store.add_turn(&old).unwrap();
        // No episodes exist — the whole log is the unsealed tail.
        assert_eq!(store.prune_old(now).unwrap(), 0);
        assert_eq!(store.get_turns(&[id]).unwrap().len(), 1);
    }
}
