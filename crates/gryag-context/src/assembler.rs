//! Multi-level context assembly.
//!
//! Five concentric layers share one token budget: immediate 20%, recent 30%,
//! relevant 25%, background 15%, episodic 10%. Each layer's share is a hard
//! ceiling; layers may underfill and a failing layer yields empty without
//! failing the whole assembly. Overflowing layers drop oldest items first.

use tracing::warn;

use gryag_core::{telemetry, Result};
use gryag_memory::{EntityType, FactRepository};

use crate::episodes::EpisodeStore;
use crate::retriever::HybridRetriever;
use crate::tokens::{estimate_text, estimate_turn, estimate_turns, truncate_history_to_tokens};
use crate::turns::ContextStore;
use crate::types::Turn;

/// Budget shares per layer, in assembly order.
const IMMEDIATE_SHARE: f64 = 0.20;
const RECENT_SHARE: f64 = 0.30;
const RELEVANT_SHARE: f64 = 0.25;
const BACKGROUND_SHARE: f64 = 0.15;
const EPISODIC_SHARE: f64 = 0.10;

const IMMEDIATE_TURNS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    pub token_budget: usize,
    /// Turn count for the recent layer before token trimming.
    pub recent_turns: usize,
    pub relevant_turns: usize,
    pub background_facts: usize,
    pub episodic_episodes: usize,
    /// When false the relevant layer stays empty (hybrid search disabled).
    pub hybrid_enabled: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            token_budget: 8000,
            recent_turns: 40,
            relevant_turns: 10,
            background_facts: 15,
            episodic_episodes: 3,
            hybrid_enabled: true,
        }
    }
}

/// The layered bundle handed to the LLM request builder.
#[derive(Debug, Default)]
pub struct AssembledContext {
    /// Immediate + recent turns, chronological, deduplicated.
    pub history: Vec<Turn>,
    /// Hybrid-retrieved turns not already in `history`, chronological.
    pub relevant: Vec<Turn>,
    /// Compact fact digest lines for the current and mentioned users.
    pub background: Vec<String>,
    /// Episode summary lines, most relevant first.
    pub episodic: Vec<String>,
    pub estimated_tokens: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
            && self.relevant.is_empty()
            && self.background.is_empty()
            && self.episodic.is_empty()
    }
}

pub struct ContextAssembler {
    turns: ContextStore,
    facts: FactRepository,
    episodes: EpisodeStore,
    retriever: HybridRetriever,
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(
        turns: ContextStore,
        facts: FactRepository,
        episodes: EpisodeStore,
        retriever: HybridRetriever,
        config: AssemblerConfig,
    ) -> Self {
        Self {
            turns,
            facts,
            episodes,
            retriever,
            config,
        }
    }

    /// Assemble the layered context for one reply.
    ///
    /// `mentioned_users` extends the background layer beyond the current
    /// sender. `query_embedding` drives the semantic part of the relevant
    /// layer and may be absent.
    pub fn assemble(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        current_user_id: i64,
        mentioned_users: &[i64],
        query_text: &str,
        query_embedding: Option<&[f32]>,
        now_ts: i64,
    ) -> AssembledContext {
        let budget = self.config.token_budget;
        let immediate_budget = share(budget, IMMEDIATE_SHARE);
        let recent_budget = share(budget, RECENT_SHARE);
        let relevant_budget = share(budget, RELEVANT_SHARE);
        let background_budget = share(budget, BACKGROUND_SHARE);
        let episodic_budget = share(budget, EPISODIC_SHARE);

        // Immediate: the last few turns in this chat+thread.
        let immediate = self
            .layer("immediate", || {
                let turns = self.turns.recent(chat_id, thread_id, IMMEDIATE_TURNS)?;
                Ok(truncate_history_to_tokens(turns, immediate_budget))
            })
            .unwrap_or_default();

        // Recent: further back in the same chat, excluding the immediate span.
        let immediate_floor = immediate.first().map(|t| t.id).unwrap_or(i64::MAX);
        let recent = self
            .layer("recent", || {
                let mut turns = self.turns.recent(chat_id, thread_id, self.config.recent_turns)?;
                turns.retain(|t| t.id < immediate_floor);
                Ok(truncate_history_to_tokens(turns, recent_budget))
            })
            .unwrap_or_default();

        // Relevant: hybrid retrieval across the chat, minus duplicates.
        let seen: Vec<i64> = immediate.iter().chain(recent.iter()).map(|t| t.id).collect();
        let relevant = self
            .layer("relevant", || {
                if !self.config.hybrid_enabled {
                    return Ok(Vec::new());
                }
                let scored = self.retriever.retrieve(
                    chat_id,
                    query_text,
                    query_embedding,
                    now_ts,
                    self.config.relevant_turns * 2,
                )?;
                let ids: Vec<i64> = scored
                    .iter()
                    .map(|s| s.turn_id)
                    .filter(|id| !seen.contains(id))
                    .take(self.config.relevant_turns)
                    .collect();
                let mut turns = self.turns.get_turns(&ids)?;
                turns.sort_by_key(|t| t.id);
                // Hard ceiling: drop oldest first.
                while turns.len() > 1 && estimate_turns(&turns) > relevant_budget {
                    turns.remove(0);
                }
                if estimate_turns(&turns) > relevant_budget {
                    turns.clear();
                }
                Ok(turns)
            })
            .unwrap_or_default();

        // Background: top-confidence facts for the sender and mentioned users.
        let background = self
            .layer("background", || {
                let mut lines = Vec::new();
                let mut user_ids = vec![current_user_id];
                user_ids.extend_from_slice(mentioned_users);
                user_ids.dedup();
                let context = chat_id.to_string();
                for uid in user_ids {
                    let facts = self.facts.get_facts(
                        EntityType::User,
                        uid,
                        &context,
                        None,
                        0.5,
                        self.config.background_facts,
                    )?;
                    for fact in facts {
                        lines.push(format!("- [{}] {}: {}", uid, fact.key, fact.value));
                    }
                }
                let chat_facts = self.facts.get_facts(
                    EntityType::Chat,
                    chat_id,
                    &context,
                    None,
                    0.5,
                    self.config.background_facts,
                )?;
                for fact in chat_facts {
                    lines.push(format!("- [chat] {}: {}", fact.key, fact.value));
                }
                Ok(trim_lines(lines, background_budget))
            })
            .unwrap_or_default();

        // Episodic: summaries of the most relevant recent episodes.
        let episodic = self
            .layer("episodic", || {
                let episodes = self.episodes.relevant(
                    chat_id,
                    thread_id,
                    query_text,
                    now_ts,
                    self.config.episodic_episodes,
                )?;
                let lines = episodes
                    .iter()
                    .map(|ep| format!("- {}: {}", ep.topic, ep.summary))
                    .collect();
                Ok(trim_lines(lines, episodic_budget))
            })
            .unwrap_or_default();

        let mut history = recent;
        history.extend(immediate);
        history.sort_by_key(|t| t.id);
        history.dedup_by_key(|t| t.id);

        let estimated_tokens = estimate_turns(&history)
            + estimate_turns(&relevant)
            + background.iter().map(|l| estimate_text(l)).sum::<usize>()
            + episodic.iter().map(|l| estimate_text(l)).sum::<usize>();

        AssembledContext {
            history,
            relevant,
            background,
            episodic,
            estimated_tokens,
        }
    }

    /// Fallback path when multi-level assembly fails or yields nothing:
    /// plain recent history trimmed to the full budget.
    pub fn fallback(&self, chat_id: i64, thread_id: Option<i64>, max_turns: usize) -> Vec<Turn> {
        telemetry::incr("context_fallbacks");
        match self.turns.recent(chat_id, thread_id, max_turns) {
            Ok(turns) => truncate_history_to_tokens(turns, self.config.token_budget),
            Err(e) => {
                warn!(error = %e, chat_id, "context fallback failed, replying without history");
                Vec::new()
            }
        }
    }

    /// Run one layer; a failure yields empty without failing the assembly.
    fn layer<T: Default>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Option<T> {
        match f() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(layer = name, error = %e, "context layer failed, yielding empty");
                None
            }
        }
    }
}

fn share(budget: usize, fraction: f64) -> usize {
    (budget as f64 * fraction) as usize
}

/// Keep lines from the front until the budget is spent.
fn trim_lines(lines: Vec<String>, budget: usize) -> Vec<String> {
    let mut used = 0;
    let mut out = Vec::new();
    for line in lines {
        let cost = estimate_text(&line);
        if used + cost > budget {
            break;
        }
        used += cost;
        out.push(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::RetrievalWeights;
    use crate::types::{EmotionalValence, EpisodeSummary, NewTurn, Role};
    use gryag_store::Storage;

    fn fixture(budget: usize) -> (ContextStore, FactRepository, EpisodeStore, ContextAssembler) {
        let storage = Storage::open_in_memory().unwrap();
        let turns = ContextStore::new(storage.clone());
        let facts = FactRepository::new(storage.clone());
        let episodes = EpisodeStore::new(storage);
        let retriever = HybridRetriever::new(
            turns.clone(),
            RetrievalWeights {
                semantic: 0.5,
                keyword: 0.3,
                temporal: 0.2,
                decay_days: 7.0,
            },
        )
        .unwrap();
        let assembler = ContextAssembler::new(
            turns.clone(),
            facts.clone(),
            episodes.clone(),
            retriever,
            AssemblerConfig {
                token_budget: budget,
                ..AssemblerConfig::default()
            },
        );
        (turns, facts, episodes, assembler)
    }

    fn add(turns: &ContextStore, text: &str, ts: i64) {
        turns
            .add_turn(&NewTurn::text_only(-100, 42, Role::User, text, ts))
            .unwrap();
    }

    #[test]
    fn history_is_chronological_and_deduplicated() {
        let (turns, _, _, assembler) = fixture(8000);
        for i in 0..30 {
            add(&turns, &format!("message number {i}"), i);
        }
        let ctx = assembler.assemble(-100, None, 42, &[], "message", None, 100);
        assert!(!ctx.history.is_empty());
        assert!(ctx.history.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn relevant_excludes_history_duplicates() {
        let (turns, _, _, assembler) = fixture(8000);
        for i in 0..10 {
            add(&turns, &format!("ordinary message {i}"), i);
        }
        let ctx = assembler.assemble(-100, None, 42, &[], "ordinary message", None, 100);
        for r in &ctx.relevant {
            assert!(
                !ctx.history.iter().any(|h| h.id == r.id),
                "turn {} duplicated across layers",
                r.id
            );
        }
    }

    #[test]
    fn background_digest_lists_confident_facts() {
        let (turns, facts, _, assembler) = fixture(8000);
        add(&turns, "hello", 1);
        facts
            .add_fact(
                EntityType::User,
                42,
                "-100",
                gryag_memory::FactCategory::Preference,
                "location",
                "kyiv",
                0.9,
                None,
                None,
            )
            .unwrap();
        facts
            .add_fact(
                EntityType::Chat,
                -100,
                "-100",
                gryag_memory::FactCategory::Rule,
                "language",
                "ukrainian",
                0.9,
                None,
                None,
            )
            .unwrap();
        let ctx = assembler.assemble(-100, None, 42, &[], "hi", None, 100);
        assert!(ctx.background.iter().any(|l| l.contains("location: kyiv")));
        assert!(ctx.background.iter().any(|l| l.starts_with("- [chat]")));
    }

    #[test]
    fn episodic_layer_lists_summaries() {
        let (turns, _, episodes, assembler) = fixture(8000);
        add(&turns, "hello", 1);
        episodes
            .seal(
                -100,
                None,
                1,
                1,
                &[42],
                &EpisodeSummary {
                    summary: "they discussed rust".into(),
                    topic: "rust".into(),
                    tags: vec![],
                    importance: 0.5,
                    emotional_valence: EmotionalValence::Neutral,
                },
                50,
            )
            .unwrap();
        let ctx = assembler.assemble(-100, None, 42, &[], "rust", None, 100);
        assert!(ctx.episodic.iter().any(|l| l.contains("they discussed rust")));
    }

    #[test]
    fn total_stays_within_budget_plus_slack() {
        let (turns, _, _, assembler) = fixture(500);
        for i in 0..200 {
            add(
                &turns,
                &format!("a rather long filler message with plenty of words in it {i}"),
                i,
            );
        }
        let ctx = assembler.assemble(-100, None, 42, &[], "filler words", None, 1000);
        let slack = 550; // budget + 10%
        assert!(
            ctx.estimated_tokens <= slack,
            "estimated {} exceeds {}",
            ctx.estimated_tokens,
            slack
        );
    }

    #[test]
    fn empty_chat_assembles_empty() {
        let (_, _, _, assembler) = fixture(8000);
        let ctx = assembler.assemble(-100, None, 42, &[], "anything", None, 100);
        assert!(ctx.is_empty());
    }

    #[test]
    fn fallback_trims_recent_history() {
        let (turns, _, _, assembler) = fixture(100);
        for i in 0..50 {
            add(&turns, &format!("filler message with several words {i}"), i);
        }
        let before = telemetry::get("context_fallbacks");
        let fallback = assembler.fallback(-100, None, 50);
        assert!(telemetry::get("context_fallbacks") > before);
        assert!(!fallback.is_empty());
        assert!(estimate_turns(&fallback) <= 100 || fallback.len() == 1);
    }
}
