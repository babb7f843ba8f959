//! System-prompt override store.
//!
//! Versioned prompt text per scope. At most one active row per
//! (scope, chat_id); activation deactivates siblings in the same scope.

use rusqlite::{params, OptionalExtension};

use gryag_core::Result;
use gryag_store::Storage;

use crate::types::{now_ts, PromptOverride, PromptScope};

#[derive(Clone)]
pub struct PromptStore {
    storage: Storage,
}

impl PromptStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Store a new prompt version for a scope and make it the active one.
    /// Returns the stored version number.
    pub fn set_prompt(
        &self,
        scope: PromptScope,
        chat_id: Option<i64>,
        admin_id: i64,
        prompt_text: &str,
    ) -> Result<i64> {
        let now = now_ts();
        self.storage.with_tx(|conn| {
            let version: i64 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_overrides
                 WHERE scope = ?1 AND chat_id IS ?2",
                params![scope.to_string(), chat_id],
                |r| r.get(0),
            )?;
            conn.execute(
                "UPDATE prompt_overrides SET is_active = 0, updated_at = ?1
                 WHERE scope = ?2 AND chat_id IS ?3 AND is_active = 1",
                params![now, scope.to_string(), chat_id],
            )?;
            conn.execute(
                "INSERT INTO prompt_overrides
                    (scope, chat_id, admin_id, version, prompt_text, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                params![scope.to_string(), chat_id, admin_id, version, prompt_text, now],
            )?;
            Ok(version)
        })
    }

    /// The active prompt text for a chat, resolved chat > global.
    /// `None` means the built-in default persona applies.
    pub fn resolve(&self, chat_id: i64) -> Result<Option<String>> {
        if let Some(text) = self.active_text(PromptScope::Chat, Some(chat_id))? {
            return Ok(Some(text));
        }
        self.active_text(PromptScope::Global, None)
    }

    pub fn active(&self, scope: PromptScope, chat_id: Option<i64>) -> Result<Option<PromptOverride>> {
        self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT id, scope, chat_id, admin_id, version, prompt_text, is_active, created_at
                 FROM prompt_overrides
                 WHERE scope = ?1 AND chat_id IS ?2 AND is_active = 1",
                params![scope.to_string(), chat_id],
                row_to_override,
            )
            .optional()
        })
    }

    fn active_text(&self, scope: PromptScope, chat_id: Option<i64>) -> Result<Option<String>> {
        Ok(self.active(scope, chat_id)?.map(|o| o.prompt_text))
    }

    /// Drop the active override in a scope. Returns whether one was active.
    pub fn reset(&self, scope: PromptScope, chat_id: Option<i64>) -> Result<bool> {
        let now = now_ts();
        self.storage.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE prompt_overrides SET is_active = 0, updated_at = ?1
                 WHERE scope = ?2 AND chat_id IS ?3 AND is_active = 1",
                params![now, scope.to_string(), chat_id],
            )?;
            Ok(n > 0)
        })
    }

    /// All stored versions for a scope, newest first.
    pub fn history(&self, scope: PromptScope, chat_id: Option<i64>) -> Result<Vec<PromptOverride>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, scope, chat_id, admin_id, version, prompt_text, is_active, created_at
                 FROM prompt_overrides
                 WHERE scope = ?1 AND chat_id IS ?2
                 ORDER BY version DESC",
            )?;
            let rows = stmt.query_map(params![scope.to_string(), chat_id], row_to_override)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Re-activate a stored version. Returns false when the version is unknown.
    pub fn activate_version(
        &self,
        scope: PromptScope,
        chat_id: Option<i64>,
        version: i64,
    ) -> Result<bool> {
        let now = now_ts();
        self.storage.with_tx(|conn| {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM prompt_overrides
                     WHERE scope = ?1 AND chat_id IS ?2 AND version = ?3",
                    params![scope.to_string(), chat_id, version],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = id else { return Ok(false) };
            conn.execute(
                "UPDATE prompt_overrides SET is_active = 0, updated_at = ?1
                 WHERE scope = ?2 AND chat_id IS ?3 AND is_active = 1",
                params![now, scope.to_string(), chat_id],
            )?;
            conn.execute(
                "UPDATE prompt_overrides SET is_active = 1, updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(true)
        })
    }
}

fn row_to_override(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptOverride> {
    let scope_str: String = row.get(1)?;
    Ok(PromptOverride {
        id: row.get(0)?,
        scope: scope_str.parse().unwrap_or(PromptScope::Global),
        chat_id: row.get(2)?,
        admin_id: row.get(3)?,
        version: row.get(4)?,
        prompt_text: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PromptStore {
        PromptStore::new(Storage::open_in_memory().unwrap())
    }

    #[test]
    fn set_prompt_versions_increment() {
        let store = store();
        assert_eq!(store.set_prompt(PromptScope::Global, None, 1, "v1").unwrap(), 1);
        assert_eq!(store.set_prompt(PromptScope::Global, None, 1, "v2").unwrap(), 2);
        let active = store.active(PromptScope::Global, None).unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.prompt_text, "v2");
    }

    #[test]
    fn at_most_one_active_per_scope() {
        let store = store();
        store.set_prompt(PromptScope::Chat, Some(-100), 1, "a").unwrap();
        store.set_prompt(PromptScope::Chat, Some(-100), 1, "b").unwrap();
        let history = store.history(PromptScope::Chat, Some(-100)).unwrap();
        assert_eq!(history.iter().filter(|o| o.is_active).count(), 1);
    }

    #[test]
    fn resolve_prefers_chat_over_global() {
        let store = store();
        store.set_prompt(PromptScope::Global, None, 1, "global persona").unwrap();
        assert_eq!(store.resolve(-100).unwrap().as_deref(), Some("global persona"));
        store.set_prompt(PromptScope::Chat, Some(-100), 1, "chat persona").unwrap();
        assert_eq!(store.resolve(-100).unwrap().as_deref(), Some("chat persona"));
        // Other chats still see the global one.
        assert_eq!(store.resolve(-200).unwrap().as_deref(), Some("global persona"));
    }

    #[test]
    fn reset_and_rollback() {
        let store = store();
        store.set_prompt(PromptScope::Global, None, 1, "v1").unwrap();
        store.set_prompt(PromptScope::Global, None, 1, "v2").unwrap();
        assert!(store.reset(PromptScope::Global, None).unwrap());
        assert!(store.resolve(-1).unwrap().is_none());
        assert!(store.activate_version(PromptScope::Global, None, 1).unwrap());
        assert_eq!(store.resolve(-1).unwrap().as_deref(), Some("v1"));
        assert!(!store.activate_version(PromptScope::Global, None, 99).unwrap());
    }
}
