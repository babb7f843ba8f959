//! Derived user/chat projections, refreshed as pipeline side-effects.

use rusqlite::{params, OptionalExtension};

use gryag_core::Result;
use gryag_store::Storage;

use crate::types::{now_ts, UserProfile};

#[derive(Clone)]
pub struct ProfileRepository {
    storage: Storage,
}

impl ProfileRepository {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Record that a user was seen in a chat: upsert display fields, bump the
    /// interaction counter, refresh last-seen.
    pub fn touch_user(
        &self,
        chat_id: i64,
        user_id: i64,
        display_name: Option<&str>,
        username: Option<&str>,
    ) -> Result<()> {
        let now = now_ts();
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_profiles (user_id, chat_id, display_name, username,
                        interaction_count, last_seen)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)
                 ON CONFLICT(user_id, chat_id) DO UPDATE SET
                    display_name = COALESCE(excluded.display_name, display_name),
                    username = COALESCE(excluded.username, username),
                    interaction_count = interaction_count + 1,
                    last_seen = excluded.last_seen",
                params![user_id, chat_id, display_name, username, now],
            )?;
            Ok(())
        })
    }

    pub fn touch_chat(&self, chat_id: i64, title: Option<&str>) -> Result<()> {
        let now = now_ts();
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_profiles (chat_id, title, interaction_count, last_seen)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    title = COALESCE(excluded.title, title),
                    interaction_count = interaction_count + 1,
                    last_seen = excluded.last_seen",
                params![chat_id, title, now],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, chat_id: i64, user_id: i64) -> Result<Option<UserProfile>> {
        self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, chat_id, display_name, username, pronouns, membership,
                        interaction_count, last_seen, summary
                 FROM user_profiles WHERE user_id = ?1 AND chat_id = ?2",
                params![user_id, chat_id],
                |row| {
                    Ok(UserProfile {
                        user_id: row.get(0)?,
                        chat_id: row.get(1)?,
                        display_name: row.get(2)?,
                        username: row.get(3)?,
                        pronouns: row.get(4)?,
                        membership: row.get(5)?,
                        interaction_count: row.get(6)?,
                        last_seen: row.get(7)?,
                        summary: row.get(8)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Find a user id in a chat by username (no leading `@`).
    pub fn find_by_username(&self, chat_id: i64, username: &str) -> Result<Option<i64>> {
        self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id FROM user_profiles
                 WHERE chat_id = ?1 AND username = ?2 COLLATE NOCASE",
                params![chat_id, username],
                |r| r.get(0),
            )
            .optional()
        })
    }

    pub fn set_summary(&self, chat_id: i64, user_id: i64, summary: &str) -> Result<()> {
        let now = now_ts();
        self.storage.with_conn(|conn| {
            conn.execute(
                "UPDATE user_profiles SET summary = ?1, summary_updated_at = ?2
                 WHERE user_id = ?3 AND chat_id = ?4",
                params![summary, now, user_id, chat_id],
            )?;
            Ok(())
        })
    }

    /// Profiles whose summary is older than `max_age_secs` (or missing) and
    /// that have been active since the last summary. Used by the background
    /// profile summariser.
    pub fn stale_profiles(&self, max_age_secs: i64, limit: usize) -> Result<Vec<UserProfile>> {
        let cutoff = now_ts() - max_age_secs;
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, chat_id, display_name, username, pronouns, membership,
                        interaction_count, last_seen, summary
                 FROM user_profiles
                 WHERE (summary_updated_at IS NULL OR summary_updated_at < ?1)
                   AND last_seen > COALESCE(summary_updated_at, 0)
                 ORDER BY last_seen DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cutoff, limit as i64], |row| {
                Ok(UserProfile {
                    user_id: row.get(0)?,
                    chat_id: row.get(1)?,
                    display_name: row.get(2)?,
                    username: row.get(3)?,
                    pronouns: row.get(4)?,
                    membership: row.get(5)?,
                    interaction_count: row.get(6)?,
                    last_seen: row.get(7)?,
                    summary: row.get(8)?,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }
}
