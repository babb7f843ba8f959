//! Unified read/write over facts keyed by
//! (entity-type, entity-id, chat-context, category, key).
//!
//! At most one active row per logical key. Repeat writes reinforce
//! (weighted-average confidence), value changes evolve, high-confidence
//! writes over a soft-deleted row reactivate it as a correction. Every
//! mutation emits a version record. Deletes are soft and idempotent.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use gryag_core::Result;
use gryag_store::Storage;

use crate::normalise::normalise;
use crate::types::*;

/// New confidence must clear this bar to resurrect a soft-deleted row.
const CORRECTION_CONFIDENCE: f64 = 0.75;

#[derive(Clone)]
pub struct FactRepository {
    storage: Storage,
}

impl FactRepository {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Store a fact, deduplicating against the existing row for the same
    /// logical key. `source_turn_id` points at the turn the fact was learned
    /// from. Returns the fact id.
    #[allow(clippy::too_many_arguments)]
    pub fn add_fact(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        chat_context: &str,
        category: FactCategory,
        key: &str,
        value: &str,
        confidence: f64,
        evidence: Option<&str>,
        source_turn_id: Option<i64>,
    ) -> Result<i64> {
        let key_norm = normalise(key);
        let value_norm = normalise(value);
        let confidence = confidence.clamp(0.0, 1.0);
        let now = now_ts();

        self.storage.with_tx(|conn| {
            // Existing active row for this key, if any.
            let active: Option<(i64, String, f64, i64)> = conn
                .query_row(
                    "SELECT id, value_norm, confidence, evidence_count FROM facts
                     WHERE entity_type = ?1 AND entity_id = ?2 AND chat_context = ?3
                       AND category = ?4 AND key = ?5 AND is_active = 1",
                    params![
                        entity_type.to_string(),
                        entity_id,
                        chat_context,
                        category.to_string(),
                        key_norm
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            if let Some((id, existing_norm, old_conf, count)) = active {
                if existing_norm == value_norm {
                    // Same knowledge restated: reinforce.
                    let merged = (old_conf * count as f64 + confidence) / (count as f64 + 1.0);
                    conn.execute(
                        "UPDATE facts SET confidence = ?1, evidence_count = evidence_count + 1,
                                evidence = COALESCE(?2, evidence),
                                source_turn_id = COALESCE(?3, source_turn_id), updated_at = ?4
                         WHERE id = ?5",
                        params![merged, evidence, source_turn_id, now, id],
                    )?;
                    insert_version(conn, id, ChangeType::Reinforcement, Some(value), Some(merged), None, now)?;
                    debug!(fact_id = id, confidence = merged, "fact reinforced");
                    return Ok(id);
                }
                // Same key, different value: the knowledge evolved.
                conn.execute(
                    "UPDATE facts SET value = ?1, value_norm = ?2, confidence = ?3,
                            evidence = COALESCE(?4, evidence),
                            source_turn_id = COALESCE(?5, source_turn_id), updated_at = ?6
                     WHERE id = ?7",
                    params![value, value_norm, confidence, evidence, source_turn_id, now, id],
                )?;
                insert_version(conn, id, ChangeType::Evolution, Some(value), Some(confidence), None, now)?;
                debug!(fact_id = id, "fact evolved");
                return Ok(id);
            }

            // No active row. A confident write may resurrect a soft-deleted one.
            let inactive: Option<i64> = conn
                .query_row(
                    "SELECT id FROM facts
                     WHERE entity_type = ?1 AND entity_id = ?2 AND chat_context = ?3
                       AND category = ?4 AND key = ?5 AND is_active = 0
                     ORDER BY updated_at DESC LIMIT 1",
                    params![
                        entity_type.to_string(),
                        entity_id,
                        chat_context,
                        category.to_string(),
                        key_norm
                    ],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = inactive {
                if confidence >= CORRECTION_CONFIDENCE {
                    conn.execute(
                        "UPDATE facts SET value = ?1, value_norm = ?2, confidence = ?3,
                                evidence = COALESCE(?4, evidence),
                                source_turn_id = COALESCE(?5, source_turn_id),
                                is_active = 1, updated_at = ?6
                         WHERE id = ?7",
                        params![value, value_norm, confidence, evidence, source_turn_id, now, id],
                    )?;
                    insert_version(conn, id, ChangeType::Correction, Some(value), Some(confidence), None, now)?;
                    debug!(fact_id = id, "fact reactivated as correction");
                    return Ok(id);
                }
            }

            conn.execute(
                "INSERT INTO facts (entity_type, entity_id, chat_context, category, key,
                        value, value_norm, confidence, evidence, source_turn_id,
                        is_active, evidence_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, 1, ?11, ?11)",
                params![
                    entity_type.to_string(),
                    entity_id,
                    chat_context,
                    category.to_string(),
                    key_norm,
                    value,
                    value_norm,
                    confidence,
                    evidence,
                    source_turn_id,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            insert_version(conn, id, ChangeType::Creation, Some(value), Some(confidence), None, now)?;
            debug!(fact_id = id, entity = %entity_type, entity_id, "fact created");
            Ok(id)
        })
    }

    /// Active facts for an entity, highest confidence first. When the legacy
    /// table exists its rows are unioned in, tagged `legacy = true`.
    pub fn get_facts(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        chat_context: &str,
        categories: Option<&[FactCategory]>,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        let cat_filter: Option<Vec<String>> =
            categories.map(|cats| cats.iter().map(|c| c.to_string()).collect());

        let mut facts = self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entity_type, entity_id, chat_context, category, key, value,
                        confidence, evidence, source_turn_id, is_active, evidence_count,
                        embedding, created_at, updated_at
                 FROM facts
                 WHERE entity_type = ?1 AND entity_id = ?2 AND chat_context = ?3
                   AND is_active = 1 AND confidence >= ?4
                 ORDER BY confidence DESC, updated_at DESC",
            )?;
            let rows = stmt.query_map(
                params![entity_type.to_string(), entity_id, chat_context, min_confidence],
                row_to_fact,
            )?;
            Ok(rows.filter_map(|r| r.ok()).collect::<Vec<Fact>>())
        })?;

        if let Some(ref cats) = cat_filter {
            facts.retain(|f| cats.contains(&f.category.to_string()));
        }

        // Read-only compatibility shim over half-migrated legacy rows.
        if entity_type == EntityType::User {
            let mut legacy = self.legacy_facts(entity_id, chat_context)?;
            if let Some(ref cats) = cat_filter {
                legacy.retain(|f| cats.contains(&f.category.to_string()));
            }
            legacy.retain(|l| {
                l.confidence >= min_confidence
                    && !facts
                        .iter()
                        .any(|f| f.category == l.category && f.key == l.key)
            });
            facts.extend(legacy);
            facts.sort_by(|a, b| {
                b.confidence
                    .total_cmp(&a.confidence)
                    .then(b.updated_at.cmp(&a.updated_at))
            });
        }

        facts.truncate(limit);
        Ok(facts)
    }

    pub fn get_fact(&self, id: i64) -> Result<Option<Fact>> {
        self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT id, entity_type, entity_id, chat_context, category, key, value,
                        confidence, evidence, source_turn_id, is_active, evidence_count,
                        embedding, created_at, updated_at
                 FROM facts WHERE id = ?1",
                [id],
                row_to_fact,
            )
            .optional()
        })
    }

    /// Evolve an existing fact's value and/or confidence.
    pub fn update_fact(
        &self,
        id: i64,
        new_value: Option<&str>,
        new_confidence: Option<f64>,
        reason: &str,
    ) -> Result<ForgetStatus> {
        let now = now_ts();
        self.storage.with_tx(|conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT id FROM facts WHERE id = ?1 AND is_active = 1", [id], |r| {
                    r.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Ok(ForgetStatus::NotFound);
            }
            if let Some(value) = new_value {
                conn.execute(
                    "UPDATE facts SET value = ?1, value_norm = ?2, updated_at = ?3 WHERE id = ?4",
                    params![value, normalise(value), now, id],
                )?;
            }
            if let Some(conf) = new_confidence {
                conn.execute(
                    "UPDATE facts SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
                    params![conf.clamp(0.0, 1.0), now, id],
                )?;
            }
            insert_version(
                conn,
                id,
                ChangeType::Evolution,
                new_value,
                new_confidence,
                Some(reason),
                now,
            )?;
            Ok(ForgetStatus::Success)
        })
    }

    /// Soft-delete a fact. Idempotent: a missing or already-inactive id
    /// reports `NotFound` without raising.
    pub fn forget_fact(&self, id: i64, reason: ForgetReason) -> Result<ForgetStatus> {
        let now = now_ts();
        self.storage.with_tx(|conn| {
            let changed = conn.execute(
                "UPDATE facts SET is_active = 0, updated_at = ?1 WHERE id = ?2 AND is_active = 1",
                params![now, id],
            )?;
            if changed == 0 {
                return Ok(ForgetStatus::NotFound);
            }
            insert_version(
                conn,
                id,
                ChangeType::Deletion,
                None,
                None,
                Some(&reason.to_string()),
                now,
            )?;
            debug!(fact_id = id, reason = %reason, "fact forgotten");
            Ok(ForgetStatus::Success)
        })
    }

    /// Bulk soft-delete of every active fact for an entity. Returns the count.
    pub fn forget_all(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        chat_context: &str,
        reason: ForgetReason,
    ) -> Result<usize> {
        let ids: Vec<i64> = self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM facts
                 WHERE entity_type = ?1 AND entity_id = ?2 AND chat_context = ?3 AND is_active = 1",
            )?;
            let rows = stmt.query_map(
                params![entity_type.to_string(), entity_id, chat_context],
                |r| r.get(0),
            )?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })?;
        for &id in &ids {
            self.forget_fact(id, reason)?;
        }
        Ok(ids.len())
    }

    /// Attach an embedding to a fact. Never blocks a write path; callers
    /// invoke this after the fact row already exists.
    pub fn set_embedding(&self, id: i64, embedding: &[f32]) -> Result<()> {
        let json = serde_json::to_string(embedding).unwrap_or_default();
        self.storage.with_conn(|conn| {
            conn.execute(
                "UPDATE facts SET embedding = ?1 WHERE id = ?2",
                params![json, id],
            )?;
            Ok(())
        })
    }

    /// Version history for a fact, oldest first.
    pub fn versions(&self, fact_id: i64) -> Result<Vec<FactVersion>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, fact_id, change_type, value, confidence, reason, created_at
                 FROM fact_versions WHERE fact_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([fact_id], |row| {
                let change_str: String = row.get(2)?;
                Ok(FactVersion {
                    id: row.get(0)?,
                    fact_id: row.get(1)?,
                    change_type: parse_change_type(&change_str),
                    value: row.get(3)?,
                    confidence: row.get(4)?,
                    reason: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    fn legacy_facts(&self, user_id: i64, chat_context: &str) -> Result<Vec<Fact>> {
        let table_exists: bool = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'legacy_user_facts'",
                [],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n > 0)
        })?;
        if !table_exists {
            return Ok(Vec::new());
        }
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category, key, value, confidence, created_at
                 FROM legacy_user_facts WHERE user_id = ?1",
            )?;
            let rows = stmt.query_map([user_id], |row| {
                let cat: String = row.get(1)?;
                Ok(Fact {
                    id: row.get(0)?,
                    entity_type: EntityType::User,
                    entity_id: user_id,
                    chat_context: chat_context.to_string(),
                    category: cat.parse().unwrap_or(FactCategory::Personal),
                    key: row.get(2)?,
                    value: row.get(3)?,
                    confidence: row.get(4)?,
                    evidence: None,
                    source_turn_id: None,
                    is_active: true,
                    evidence_count: 1,
                    embedding: None,
                    created_at: row.get(5)?,
                    updated_at: row.get(5)?,
                    legacy: true,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }
}

fn insert_version(
    conn: &Connection,
    fact_id: i64,
    change_type: ChangeType,
    value: Option<&str>,
    confidence: Option<f64>,
    reason: Option<&str>,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO fact_versions (fact_id, change_type, value, confidence, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![fact_id, change_type.to_string(), value, confidence, reason, now],
    )?;
    Ok(())
}

fn parse_change_type(s: &str) -> ChangeType {
    match s {
        "creation" => ChangeType::Creation,
        "reinforcement" => ChangeType::Reinforcement,
        "evolution" => ChangeType::Evolution,
        "correction" => ChangeType::Correction,
        _ => ChangeType::Deletion,
    }
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let entity_str: String = row.get(1)?;
    let cat_str: String = row.get(4)?;
    let embedding_json: Option<String> = row.get(12)?;
    Ok(Fact {
        id: row.get(0)?,
        entity_type: entity_str.parse().unwrap_or(EntityType::User),
        entity_id: row.get(2)?,
        chat_context: row.get(3)?,
        category: cat_str.parse().unwrap_or(FactCategory::Personal),
        key: row.get(5)?,
        value: row.get(6)?,
        confidence: row.get(7)?,
        evidence: row.get(8)?,
        source_turn_id: row.get(9)?,
        is_active: row.get::<_, i64>(10)? != 0,
        evidence_count: row.get(11)?,
        embedding: embedding_json.and_then(|j| serde_json::from_str(&j).ok()),
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        legacy: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> FactRepository {
        FactRepository::new(Storage::open_in_memory().unwrap())
    }

    fn add_location(repo: &FactRepository, value: &str, confidence: f64) -> i64 {
        repo.add_fact(
            EntityType::User,
            42,
            "-100",
            FactCategory::Preference,
            "location",
            value,
            confidence,
            Some("i live in kyiv"),
            None,
        )
        .unwrap()
    }

    #[test]
    fn create_then_reinforce_same_value() {
        let repo = repo();
        let id = add_location(&repo, "Kyiv", 0.8);
        // Normalised-equal value reinforces the same row.
        let id2 = add_location(&repo, "kiev", 0.6);
        assert_eq!(id, id2);

        let fact = repo.get_fact(id).unwrap().unwrap();
        assert_eq!(fact.evidence_count, 2);
        assert!((fact.confidence - 0.7).abs() < 1e-9);

        let versions = repo.versions(id).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].change_type, ChangeType::Creation);
        assert_eq!(versions[1].change_type, ChangeType::Reinforcement);
    }

    #[test]
    fn at_most_one_active_row_per_key() {
        let repo = repo();
        add_location(&repo, "Kyiv", 0.8);
        add_location(&repo, "Lviv", 0.9);
        let facts = repo
            .get_facts(EntityType::User, 42, "-100", None, 0.0, 100)
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, "Lviv");
        let versions = repo.versions(facts[0].id).unwrap();
        assert_eq!(versions.last().unwrap().change_type, ChangeType::Evolution);
    }

    #[test]
    fn forget_is_idempotent() {
        let repo = repo();
        let id = add_location(&repo, "Kyiv", 0.8);
        assert_eq!(
            repo.forget_fact(id, ForgetReason::UserRequested).unwrap(),
            ForgetStatus::Success
        );
        assert_eq!(
            repo.forget_fact(id, ForgetReason::UserRequested).unwrap(),
            ForgetStatus::NotFound
        );
        let fact = repo.get_fact(id).unwrap().unwrap();
        assert!(!fact.is_active);
        let versions = repo.versions(id).unwrap();
        assert_eq!(
            versions
                .iter()
                .filter(|v| v.change_type == ChangeType::Deletion)
                .count(),
            1
        );
    }

    #[test]
    fn forget_absent_id_is_not_found() {
        let repo = repo();
        assert_eq!(
            repo.forget_fact(9999, ForgetReason::Outdated).unwrap(),
            ForgetStatus::NotFound
        );
    }

    #[test]
    fn confident_rewrite_reactivates_as_correction() {
        let repo = repo();
        let id = add_location(&repo, "Kyiv", 0.8);
        repo.forget_fact(id, ForgetReason::Incorrect).unwrap();

        let id2 = add_location(&repo, "Kharkiv", 0.9);
        assert_eq!(id, id2);
        let fact = repo.get_fact(id).unwrap().unwrap();
        assert!(fact.is_active);
        assert_eq!(fact.value, "Kharkiv");
        let versions = repo.versions(id).unwrap();
        assert_eq!(versions.last().unwrap().change_type, ChangeType::Correction);
    }

    #[test]
    fn weak_rewrite_over_deleted_row_creates_new() {
        let repo = repo();
        let id = add_location(&repo, "Kyiv", 0.8);
        repo.forget_fact(id, ForgetReason::Incorrect).unwrap();

        let id2 = add_location(&repo, "Kharkiv", 0.4);
        assert_ne!(id, id2);
    }

    #[test]
    fn get_facts_orders_by_confidence() {
        let repo = repo();
        repo.add_fact(
            EntityType::User, 42, "-100", FactCategory::Skill, "language", "rust", 0.5, None, None,
        )
        .unwrap();
        repo.add_fact(
            EntityType::User, 42, "-100", FactCategory::Preference, "editor", "helix", 0.9, None, None,
        )
        .unwrap();
        let facts = repo
            .get_facts(EntityType::User, 42, "-100", None, 0.0, 10)
            .unwrap();
        assert_eq!(facts[0].value, "helix");
        assert!(facts.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    }

    #[test]
    fn category_and_confidence_filters() {
        let repo = repo();
        repo.add_fact(
            EntityType::User, 42, "-100", FactCategory::Skill, "language", "rust", 0.5, None, None,
        )
        .unwrap();
        repo.add_fact(
            EntityType::User, 42, "-100", FactCategory::Opinion, "tabs", "spaces", 0.9, None, None,
        )
        .unwrap();
        let skills = repo
            .get_facts(
                EntityType::User,
                42,
                "-100",
                Some(&[FactCategory::Skill]),
                0.0,
                10,
            )
            .unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].category, FactCategory::Skill);

        let confident = repo
            .get_facts(EntityType::User, 42, "-100", None, 0.8, 10)
            .unwrap();
        assert_eq!(confident.len(), 1);
        assert_eq!(confident[0].value, "spaces");
    }

    #[test]
    fn chat_entity_facts_are_scoped() {
        let repo = repo();
        repo.add_fact(
            EntityType::Chat, -100, "-100", FactCategory::Rule, "language policy",
            "ukrainian only", 0.9, None, None,
        )
        .unwrap();
        let user_facts = repo
            .get_facts(EntityType::User, -100, "-100", None, 0.0, 10)
            .unwrap();
        assert!(user_facts.is_empty());
        let chat_facts = repo
            .get_facts(EntityType::Chat, -100, "-100", None, 0.0, 10)
            .unwrap();
        assert_eq!(chat_facts.len(), 1);
    }

    #[test]
    fn forget_all_clears_entity() {
        let repo = repo();
        add_location(&repo, "Kyiv", 0.8);
        repo.add_fact(
            EntityType::User, 42, "-100", FactCategory::Skill, "language", "rust", 0.7, None, None,
        )
        .unwrap();
        let n = repo
            .forget_all(EntityType::User, 42, "-100", ForgetReason::UserRequested)
            .unwrap();
        assert_eq!(n, 2);
        assert!(repo
            .get_facts(EntityType::User, 42, "-100", None, 0.0, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn source_turn_id_round_trips_and_sticks() {
        let repo = repo();
        let id = repo
            .add_fact(
                EntityType::User, 42, "-100", FactCategory::Preference, "location", "Kyiv",
                0.8, None, Some(17),
            )
            .unwrap();
        assert_eq!(repo.get_fact(id).unwrap().unwrap().source_turn_id, Some(17));

        // A reinforcement without a pointer keeps the original evidence turn.
        repo.add_fact(
            EntityType::User, 42, "-100", FactCategory::Preference, "location", "kiev",
            0.6, None, None,
        )
        .unwrap();
        assert_eq!(repo.get_fact(id).unwrap().unwrap().source_turn_id, Some(17));

        // A later write that carries one updates it.
        repo.add_fact(
            EntityType::User, 42, "-100", FactCategory::Preference, "location", "kyiv",
            0.9, None, Some(40),
        )
        .unwrap();
        assert_eq!(repo.get_fact(id).unwrap().unwrap().source_turn_id, Some(40));
    }

    #[test]
    fn legacy_rows_surface_read_only() {
        let repo = repo();
        repo.storage
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TABLE legacy_user_facts (
                        id INTEGER PRIMARY KEY, user_id INTEGER, category TEXT,
                        key TEXT, value TEXT, confidence REAL, created_at INTEGER
                     );
                     INSERT INTO legacy_user_facts VALUES (1, 42, 'personal', 'name', 'Taras', 0.9, 0);",
                )
            })
            .unwrap();
        let facts = repo
            .get_facts(EntityType::User, 42, "-100", None, 0.0, 10)
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert!(facts[0].legacy);
    }

    #[test]
    fn update_fact_records_evolution() {
        let repo = repo();
        let id = add_location(&repo, "Kyiv", 0.8);
        assert_eq!(
            repo.update_fact(id, Some("Lviv"), Some(0.95), "moved cities")
                .unwrap(),
            ForgetStatus::Success
        );
        let fact = repo.get_fact(id).unwrap().unwrap();
        assert_eq!(fact.value, "Lviv");
        assert!((fact.confidence - 0.95).abs() < 1e-9);
        assert_eq!(
            repo.update_fact(777, Some("x"), None, "nope").unwrap(),
            ForgetStatus::NotFound
        );
    }
}
