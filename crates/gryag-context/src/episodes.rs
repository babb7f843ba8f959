//! Episodic memory: boundary detection, sealing, and summarisation.
//!
//! The monitor examines the unsealed tail of each chat/thread (turns past the
//! episode watermark) and seals an episode when the conversation went idle,
//! the topic shifted (embedding distance between consecutive windows), or the
//! participant set materially changed. Summaries come from an LLM call; when
//! that fails a heuristic summary is stored so downstream consumers always
//! see one. Episode ranges never overlap — the watermark is the max sealed
//! `end_turn_id` per chat/thread.

use async_trait::async_trait;
use rusqlite::params;
use tracing::{debug, info, warn};

use gryag_core::Result;
use gryag_store::Storage;

use crate::turns::ContextStore;
use crate::types::{EmotionalValence, Episode, EpisodeSummary, Role, Turn};

/// Produces a summary for a sealed turn range. Implemented by the LLM client
/// in the binary; the monitor falls back to heuristics when it returns None.
#[async_trait]
pub trait EpisodeSummarizer: Send + Sync {
    async fn summarize(&self, turns: &[Turn]) -> Option<EpisodeSummary>;
}

#[derive(Debug, Clone, Copy)]
pub struct EpisodeConfig {
    /// Idle gap that closes an episode, seconds.
    pub gap_seconds: i64,
    /// Embedding-distance threshold for a topic shift (0 = identical).
    pub boundary_distance: f64,
    /// Minimum turns before an episode may seal.
    pub min_turns: usize,
    /// Unsealed turns at which a long conversation is segmented even with no
    /// other trigger.
    pub max_span: usize,
}

#[derive(Clone)]
pub struct EpisodeStore {
    storage: Storage,
}

impl EpisodeStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Max sealed end_turn_id for a chat/thread; 0 when nothing is sealed.
    pub fn watermark(&self, chat_id: i64, thread_id: Option<i64>) -> Result<i64> {
        self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(end_turn_id), 0) FROM episodes
                 WHERE chat_id = ?1 AND thread_id IS ?2",
                params![chat_id, thread_id],
                |r| r.get(0),
            )
        })
    }

    /// Seal an episode. Immutable after this point.
    pub fn seal(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        start_turn_id: i64,
        end_turn_id: i64,
        participants: &[i64],
        summary: &EpisodeSummary,
        now_ts: i64,
    ) -> Result<i64> {
        let participants_json = serde_json::to_string(participants).unwrap_or_default();
        let tags_json = serde_json::to_string(&summary.tags).unwrap_or_default();
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO episodes (chat_id, thread_id, start_turn_id, end_turn_id,
                        participants, summary, topic, tags, importance, emotional_valence,
                        created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    chat_id,
                    thread_id,
                    start_turn_id,
                    end_turn_id,
                    participants_json,
                    summary.summary,
                    summary.topic,
                    tags_json,
                    summary.importance,
                    summary.emotional_valence.to_string(),
                    now_ts,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent episodes for a chat, newest first.
    pub fn recent(&self, chat_id: i64, thread_id: Option<i64>, limit: usize) -> Result<Vec<Episode>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, thread_id, start_turn_id, end_turn_id, participants,
                        summary, topic, tags, importance, emotional_valence, created_at
                 FROM episodes
                 WHERE chat_id = ?1 AND thread_id IS ?2
                 ORDER BY end_turn_id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![chat_id, thread_id, limit as i64], row_to_episode)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Episodes ranked by recency plus topical overlap with the query words.
    pub fn relevant(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        query: &str,
        now_ts: i64,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let candidates = self.recent(chat_id, thread_id, 50)?;
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();

        let mut scored: Vec<(f64, Episode)> = candidates
            .into_iter()
            .map(|ep| {
                let age_days = ((now_ts - ep.created_at).max(0) as f64) / 86400.0;
                let recency = (-age_days / 7.0).exp();
                let haystack = format!(
                    "{} {} {}",
                    ep.topic.to_lowercase(),
                    ep.summary.to_lowercase(),
                    ep.tags.join(" ").to_lowercase()
                );
                let overlap = query_words
                    .iter()
                    .filter(|w| w.len() > 2 && haystack.contains(w.as_str()))
                    .count() as f64;
                let topical = (overlap / 5.0).min(1.0);
                (0.5 * recency + 0.5 * topical, ep)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, ep)| ep).collect())
    }
}

pub struct EpisodeMonitor {
    turns: ContextStore,
    episodes: EpisodeStore,
    config: EpisodeConfig,
}

impl EpisodeMonitor {
    pub fn new(turns: ContextStore, episodes: EpisodeStore, config: EpisodeConfig) -> Self {
        Self {
            turns,
            episodes,
            config,
        }
    }

    /// Examine the unsealed tail of one chat/thread and seal at most one
    /// episode per call. Returns the sealed episode id, if any.
    pub async fn tick(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        now_ts: i64,
        summarizer: &dyn EpisodeSummarizer,
    ) -> Result<Option<i64>> {
        let watermark = self.episodes.watermark(chat_id, thread_id)?;
        let tail = self.turns.turns_after(chat_id, thread_id, watermark, 500)?;
        if tail.len() < self.config.min_turns {
            return Ok(None);
        }

        let boundary = self.find_boundary(&tail, now_ts);
        let Some(end_index) = boundary else {
            return Ok(None);
        };

        let span = &tail[..=end_index];
        let mut participants: Vec<i64> = span
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.user_id)
            .collect();
        participants.sort_unstable();
        participants.dedup();

        let summary = match summarizer.summarize(span).await {
            Some(s) => s,
            None => {
                warn!(chat_id, "episode summariser unavailable, using heuristic");
                heuristic_summary(span)
            }
        };

        let id = self.episodes.seal(
            chat_id,
            thread_id,
            span[0].id,
            span[end_index].id,
            &participants,
            &summary,
            now_ts,
        )?;
        info!(episode_id = id, chat_id, turns = span.len(), topic = %summary.topic, "episode sealed");
        Ok(Some(id))
    }

    /// Index of the last turn of a closing episode, or None while it is
    /// still open. Triggers, in order: idle gap, topic shift, participant
    /// change.
    fn find_boundary(&self, tail: &[Turn], now_ts: i64) -> Option<usize> {
        let min = self.config.min_turns;

        // (a) the whole tail went idle.
        if let Some(last) = tail.last() {
            if now_ts - last.ts > self.config.gap_seconds && tail.len() >= min {
                return Some(tail.len() - 1);
            }
        }

        // (b) an internal idle gap between consecutive turns.
        for i in min.saturating_sub(1)..tail.len().saturating_sub(1) {
            if tail[i + 1].ts - tail[i].ts > self.config.gap_seconds {
                return Some(i);
            }
        }

        // (c) topic shift: embedding distance between consecutive windows.
        if let Some(i) = self.topic_shift_index(tail) {
            return Some(i);
        }

        // (d) participant set materially changed between halves of the tail.
        if let Some(i) = self.participant_shift_index(tail) {
            return Some(i);
        }

        // (e) the open span grew past the segmentation ceiling.
        if self.config.max_span > 0 && tail.len() >= self.config.max_span {
            return Some(self.config.max_span - 1);
        }
        None
    }

    fn topic_shift_index(&self, tail: &[Turn]) -> Option<usize> {
        const WINDOW: usize = 3;
        let min = self.config.min_turns;
        if tail.len() < min + WINDOW {
            return None;
        }
        for i in min.saturating_sub(1)..tail.len() - WINDOW {
            let before = window_centroid(&tail[i.saturating_sub(WINDOW - 1)..=i]);
            let after = window_centroid(&tail[i + 1..i + 1 + WINDOW]);
            if let (Some(a), Some(b)) = (before, after) {
                let distance = 1.0 - cosine(&a, &b);
                if distance > self.config.boundary_distance {
                    debug!(index = i, distance, "topic shift boundary");
                    return Some(i);
                }
            }
        }
        None
    }

    fn participant_shift_index(&self, tail: &[Turn]) -> Option<usize> {
        let min = self.config.min_turns;
        if tail.len() < min * 2 {
            return None;
        }
        let mid = tail.len() / 2;
        let head: std::collections::HashSet<i64> = tail[..mid]
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.user_id)
            .collect();
        let rest: std::collections::HashSet<i64> = tail[mid..]
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.user_id)
            .collect();
        if head.is_empty() || rest.is_empty() {
            return None;
        }
        let shared = head.intersection(&rest).count();
        // Materially changed: no overlap at all between the two halves.
        if shared == 0 {
            return Some(mid - 1);
        }
        None
    }
}

fn window_centroid(turns: &[Turn]) -> Option<Vec<f32>> {
    let embedded: Vec<&Vec<f32>> = turns.iter().filter_map(|t| t.embedding.as_ref()).collect();
    if embedded.is_empty() {
        return None;
    }
    let dim = embedded[0].len();
    let mut centroid = vec![0.0f32; dim];
    for emb in &embedded {
        if emb.len() != dim {
            return None;
        }
        for (c, &v) in centroid.iter_mut().zip(emb.iter()) {
            *c += v;
        }
    }
    let n = embedded.len() as f32;
    for c in &mut centroid {
        *c /= n;
    }
    Some(centroid)
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        na += f64::from(x) * f64::from(x);
        nb += f64::from(y) * f64::from(y);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "in", "on", "at", "to",
    "of", "for", "with", "that", "this", "it", "its", "you", "i", "we", "they", "не", "і", "й",
    "та", "що", "це", "як", "у", "в", "на", "з", "до", "по", "про", "так", "ні", "а", "але",
];

/// Fallback summary when the LLM is unavailable: topic from the first
/// message's leading phrase, tags from word frequencies minus stop-words.
pub fn heuristic_summary(turns: &[Turn]) -> EpisodeSummary {
    let first_text = turns
        .iter()
        .find(|t| !t.text.is_empty())
        .map(|t| t.text.as_str())
        .unwrap_or("");
    let topic: String = first_text.split_whitespace().take(6).collect::<Vec<_>>().join(" ");

    let mut freq: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for turn in turns {
        for word in turn.text.to_lowercase().split_whitespace() {
            let word: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            if word.len() > 2 && !STOP_WORDS.contains(&word.as_str()) {
                *freq.entry(word).or_insert(0) += 1;
            }
        }
    }
    let mut by_count: Vec<(String, usize)> = freq.into_iter().collect();
    by_count.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let tags: Vec<String> = by_count.into_iter().take(5).map(|(w, _)| w).collect();

    EpisodeSummary {
        summary: format!("{} messages about: {}", turns.len(), topic),
        topic,
        tags,
        importance: 0.3,
        emotional_valence: EmotionalValence::Neutral,
    }
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let participants_json: String = row.get(5)?;
    let tags_json: String = row.get(8)?;
    let valence_str: String = row.get(10)?;
    Ok(Episode {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        thread_id: row.get(2)?,
        start_turn_id: row.get(3)?,
        end_turn_id: row.get(4)?,
        participants: serde_json::from_str(&participants_json).unwrap_or_default(),
        summary: row.get(6)?,
        topic: row.get(7)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        importance: row.get(9)?,
        emotional_valence: valence_str.parse().unwrap_or(EmotionalValence::Neutral),
        created_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewTurn;

    struct NoSummarizer;

    #[async_trait]
    impl EpisodeSummarizer for NoSummarizer {
        async fn summarize(&self, _turns: &[Turn]) -> Option<EpisodeSummary> {
            None
        }
    }

    struct FixedSummarizer;

    #[async_trait]
    impl EpisodeSummarizer for FixedSummarizer {
        async fn summarize(&self, _turns: &[Turn]) -> Option<EpisodeSummary> {
            Some(EpisodeSummary {
                summary: "they argued about tabs".into(),
                topic: "tabs vs spaces".into(),
                tags: vec!["editors".into()],
                importance: 0.8,
                emotional_valence: EmotionalValence::Mixed,
            })
        }
    }

    fn fixture() -> (ContextStore, EpisodeStore, EpisodeMonitor) {
        let storage = Storage::open_in_memory().unwrap();
        let turns = ContextStore::new(storage.clone());
        let episodes = EpisodeStore::new(storage);
        let monitor = EpisodeMonitor::new(
            turns.clone(),
            episodes.clone(),
            EpisodeConfig {
                gap_seconds: 1800,
                boundary_distance: 0.55,
                min_turns: 3,
                max_span: 50,
            },
        );
        (turns, episodes, monitor)
    }

    fn add(turns: &ContextStore, user_id: i64, text: &str, ts: i64) {
        turns
            .add_turn(&NewTurn::text_only(-100, user_id, Role::User, text, ts))
            .unwrap();
    }

    #[tokio::test]
    async fn idle_gap_seals_episode() {
        let (turns, episodes, monitor) = fixture();
        for i in 0..4 {
            add(&turns, 42, &format!("message {i}"), 100 + i);
        }
        // A tick long after the last turn: the whole tail is stale.
        let id = monitor
            .tick(-100, None, 100 + 4 + 3600, &FixedSummarizer)
            .await
            .unwrap();
        assert!(id.is_some());
        let sealed = episodes.recent(-100, None, 10).unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].topic, "tabs vs spaces");
        assert_eq!(sealed[0].participants, vec![42]);
    }

    #[tokio::test]
    async fn too_few_turns_stay_open() {
        let (turns, _, monitor) = fixture();
        add(&turns, 42, "only one", 100);
        let id = monitor.tick(-100, None, 100_000, &FixedSummarizer).await.unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn ranges_never_overlap() {
        let (turns, episodes, monitor) = fixture();
        for i in 0..4 {
            add(&turns, 42, &format!("first block {i}"), 100 + i);
        }
        monitor.tick(-100, None, 10_000, &FixedSummarizer).await.unwrap();
        for i in 0..4 {
            add(&turns, 42, &format!("second block {i}"), 20_000 + i);
        }
        monitor.tick(-100, None, 100_000, &FixedSummarizer).await.unwrap();

        let sealed = episodes.recent(-100, None, 10).unwrap();
        assert_eq!(sealed.len(), 2);
        let (newer, older) = (&sealed[0], &sealed[1]);
        assert!(older.end_turn_id < newer.start_turn_id);
    }

    #[tokio::test]
    async fn heuristic_fallback_always_produces_summary() {
        let (turns, episodes, monitor) = fixture();
        for i in 0..4 {
            add(&turns, 42, "the deploy pipeline keeps failing badly", 100 + i);
        }
        monitor.tick(-100, None, 10_000, &NoSummarizer).await.unwrap();
        let sealed = episodes.recent(-100, None, 10).unwrap();
        assert_eq!(sealed.len(), 1);
        assert!(!sealed[0].summary.is_empty());
        assert!(!sealed[0].topic.is_empty());
        assert!(sealed[0].tags.contains(&"deploy".to_string()));
    }

    #[tokio::test]
    async fn internal_gap_seals_only_the_head() {
        let (turns, episodes, monitor) = fixture();
        for i in 0..4 {
            add(&turns, 42, &format!("old {i}"), 100 + i);
        }
        for i in 0..2 {
            add(&turns, 42, &format!("new {i}"), 50_000 + i);
        }
        // Tick close to the new turns: only the head block is stale.
        monitor.tick(-100, None, 50_010, &FixedSummarizer).await.unwrap();
        let sealed = episodes.recent(-100, None, 10).unwrap();
        assert_eq!(sealed.len(), 1);
        // Watermark sits at the end of the head block; the new turns stay open.
        let wm = episodes.watermark(-100, None).unwrap();
        let open = turns.turns_after(-100, None, wm, 100).unwrap();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn overlong_span_is_segmented() {
        let (turns, episodes, _) = fixture();
        let monitor = EpisodeMonitor::new(
            turns.clone(),
            episodes.clone(),
            EpisodeConfig {
                gap_seconds: 100_000,
                boundary_distance: 0.55,
                min_turns: 3,
                max_span: 5,
            },
        );
        for i in 0..8 {
            add(&turns, 42, &format!("steady stream {i}"), 100 + i);
        }
        // No idle gap anywhere, but the open span passed the ceiling.
        monitor.tick(-100, None, 110, &FixedSummarizer).await.unwrap();
        let sealed = episodes.recent(-100, None, 10).unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].end_turn_id - sealed[0].start_turn_id, 4);
    }

    #[test]
    fn heuristic_summary_filters_stop_words() {
        let turns: Vec<Turn> = Vec::new();
        let s = heuristic_summary(&turns);
        assert!(s.tags.is_empty());
        assert_eq!(s.emotional_valence, EmotionalValence::Neutral);
    }

    #[test]
    fn relevant_ranks_topical_overlap() {
        let (_, episodes, _) = fixture();
        let mk = |topic: &str, tags: Vec<&str>| EpisodeSummary {
            summary: format!("about {topic}"),
            topic: topic.into(),
            tags: tags.into_iter().map(String::from).collect(),
            importance: 0.5,
            emotional_valence: EmotionalValence::Neutral,
        };
        episodes
            .seal(-100, None, 1, 2, &[42], &mk("rust borrow checker", vec!["rust"]), 1000)
            .unwrap();
        episodes
            .seal(-100, None, 3, 4, &[42], &mk("weekend plans", vec!["travel"]), 1000)
            .unwrap();
        let ranked = episodes
            .relevant(-100, None, "rust lifetimes question", 1000, 2)
            .unwrap();
        assert_eq!(ranked[0].topic, "rust borrow checker");
    }
}
