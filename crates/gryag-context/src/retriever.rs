//! Hybrid retrieval over the turn log.
//!
//! Final score is a convex combination of semantic, keyword, and temporal
//! signals: `s = w_sem·s_sem + w_kw·s_kw + w_tmp·s_tmp`. The candidate set is
//! the union of the top semantic, top keyword, and most-recent turns, then
//! re-ranked together. Ties break by recency. Turns without embeddings score
//! `s_sem = 0` rather than being excluded.

use std::collections::HashMap;

use gryag_core::{GryagError, Result};

use crate::turns::ContextStore;

/// How many candidates each signal contributes before re-ranking.
const K_SEMANTIC: usize = 200;
const K_KEYWORD: usize = 50;
const K_TEMPORAL: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct RetrievalWeights {
    pub semantic: f64,
    pub keyword: f64,
    pub temporal: f64,
    /// τ for the recency decay `exp(-Δt / τ)`, in days.
    pub decay_days: f64,
}

impl RetrievalWeights {
    pub fn validate(&self) -> Result<()> {
        let sum = self.semantic + self.keyword + self.temporal;
        if (sum - 1.0).abs() > 0.01 {
            return Err(GryagError::ConfigInvalid(format!(
                "retrieval weights must sum to 1.0 (got {sum:.3})"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScoredTurn {
    pub turn_id: i64,
    pub score: f64,
    pub ts: i64,
}

pub struct HybridRetriever {
    store: ContextStore,
    weights: RetrievalWeights,
}

impl HybridRetriever {
    pub fn new(store: ContextStore, weights: RetrievalWeights) -> Result<Self> {
        weights.validate()?;
        Ok(Self { store, weights })
    }

    /// Rank turns in a chat against a query. `query_embedding` is optional;
    /// without it the semantic signal contributes nothing.
    pub fn retrieve(
        &self,
        chat_id: i64,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        now_ts: i64,
        limit: usize,
    ) -> Result<Vec<ScoredTurn>> {
        // Candidate signals, keyed by turn id.
        let mut semantic: HashMap<i64, f64> = HashMap::new();
        let mut timestamps: HashMap<i64, i64> = HashMap::new();

        if let Some(query_emb) = query_embedding {
            let mut scored: Vec<(i64, f64, i64)> = self
                .store
                .recent_embedded(chat_id, K_SEMANTIC)?
                .into_iter()
                .map(|(id, emb, ts)| (id, normalised_cosine(query_emb, &emb), ts))
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            for (id, s, ts) in scored.into_iter().take(K_SEMANTIC) {
                semantic.insert(id, s);
                timestamps.insert(id, ts);
            }
        }

        let keyword: HashMap<i64, f64> = self
            .store
            .search_keyword(chat_id, query_text, K_KEYWORD)?
            .into_iter()
            .collect();

        let recent = self.store.recent_ids(chat_id, K_TEMPORAL)?;
        for &(id, ts) in &recent {
            timestamps.insert(id, ts);
        }

        // Union of all candidates.
        let mut candidate_ids: Vec<i64> = semantic
            .keys()
            .chain(keyword.keys())
            .copied()
            .chain(recent.iter().map(|&(id, _)| id))
            .collect();
        candidate_ids.sort_unstable();
        candidate_ids.dedup();

        // Timestamps for keyword-only candidates.
        let missing_ts: Vec<i64> = candidate_ids
            .iter()
            .copied()
            .filter(|id| !timestamps.contains_key(id))
            .collect();
        for turn in self.store.get_turns(&missing_ts)? {
            timestamps.insert(turn.id, turn.ts);
        }

        let tau_secs = self.weights.decay_days * 86400.0;
        let mut ranked: Vec<ScoredTurn> = candidate_ids
            .into_iter()
            .filter_map(|id| {
                let ts = *timestamps.get(&id)?;
                let s_sem = semantic.get(&id).copied().unwrap_or(0.0);
                let s_kw = keyword.get(&id).copied().unwrap_or(0.0);
                let age = (now_ts - ts).max(0) as f64;
                let s_tmp = (-age / tau_secs).exp();
                let score = self.weights.semantic * s_sem
                    + self.weights.keyword * s_kw
                    + self.weights.temporal * s_tmp;
                Some(ScoredTurn { turn_id: id, score, ts })
            })
            .collect();

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.ts.cmp(&a.ts)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}

/// Cosine similarity folded from [-1,1] into [0,1].
fn normalised_cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
    (cos + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewTurn, Role};
    use gryag_store::Storage;

    fn fixture() -> (ContextStore, HybridRetriever) {
        let store = ContextStore::new(Storage::open_in_memory().unwrap());
        let weights = RetrievalWeights {
            semantic: 0.5,
            keyword: 0.3,
            temporal: 0.2,
            decay_days: 7.0,
        };
        let retriever = HybridRetriever::new(store.clone(), weights).unwrap();
        (store, retriever)
    }

    fn add(store: &ContextStore, text: &str, embedding: Option<Vec<f32>>, ts: i64) -> i64 {
        let mut turn = NewTurn::text_only(-100, 42, Role::User, text, ts);
        turn.embedding = embedding;
        store.add_turn(&turn).unwrap()
    }

    #[test]
    fn invalid_weights_rejected() {
        let store = ContextStore::new(Storage::open_in_memory().unwrap());
        let bad = RetrievalWeights {
            semantic: 0.9,
            keyword: 0.3,
            temporal: 0.2,
            decay_days: 7.0,
        };
        assert!(HybridRetriever::new(store, bad).is_err());
    }

    #[test]
    fn keyword_match_outranks_noise() {
        let (store, retriever) = fixture();
        let hit = add(&store, "the deploy pipeline broke on friday", None, 100);
        add(&store, "lunch plans anyone", None, 100);
        let ranked = retriever
            .retrieve(-100, "deploy pipeline", None, 200, 10)
            .unwrap();
        assert_eq!(ranked[0].turn_id, hit);
    }

    #[test]
    fn semantic_signal_ranks_similar_embedding_first() {
        let (store, retriever) = fixture();
        let similar = add(&store, "alpha", Some(vec![1.0, 0.0]), 100);
        add(&store, "beta", Some(vec![-1.0, 0.0]), 100);
        let ranked = retriever
            .retrieve(-100, "zzz_no_keyword_match", Some(&[1.0, 0.0]), 200, 10)
            .unwrap();
        assert_eq!(ranked[0].turn_id, similar);
    }

    #[test]
    fn missing_embeddings_score_zero_semantic_not_excluded() {
        let (store, retriever) = fixture();
        let plain = add(&store, "plain turn", None, 100);
        let ranked = retriever
            .retrieve(-100, "plain", Some(&[1.0, 0.0]), 200, 10)
            .unwrap();
        assert!(ranked.iter().any(|s| s.turn_id == plain));
    }

    #[test]
    fn scores_are_monotonically_non_increasing() {
        let (store, retriever) = fixture();
        for i in 0..20 {
            add(&store, &format!("message number {i}"), None, i);
        }
        let ranked = retriever.retrieve(-100, "message", None, 100, 20).unwrap();
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn tie_breaks_by_recency() {
        // Identical text → identical keyword score; zero temporal weight
        // forces an exact score tie, leaving recency as the tie-breaker.
        let store = ContextStore::new(Storage::open_in_memory().unwrap());
        let retriever = HybridRetriever::new(
            store.clone(),
            RetrievalWeights {
                semantic: 0.0,
                keyword: 1.0,
                temporal: 0.0,
                decay_days: 7.0,
            },
        )
        .unwrap();
        let now = 7200;
        let older = add(&store, "identical text here", None, now - 7200);
        let newer = add(&store, "identical text here", None, now - 300);
        let ranked = retriever
            .retrieve(-100, "identical text here", None, now, 10)
            .unwrap();
        let pos_new = ranked.iter().position(|s| s.turn_id == newer).unwrap();
        let pos_old = ranked.iter().position(|s| s.turn_id == older).unwrap();
        assert!(pos_new < pos_old, "5-minute-old turn must rank first on a tie");
    }

    #[test]
    fn recency_decay_prefers_fresh_turns() {
        let (store, retriever) = fixture();
        let now = 30 * 86400;
        let old = add(&store, "x", None, 0);
        let fresh = add(&store, "y", None, now - 60);
        let ranked = retriever.retrieve(-100, "zzz", None, now, 10).unwrap();
        let pos_fresh = ranked.iter().position(|s| s.turn_id == fresh).unwrap();
        let pos_old = ranked.iter().position(|s| s.turn_id == old).unwrap();
        assert!(pos_fresh < pos_old);
    }

    #[test]
    fn cosine_normalisation_bounds() {
        assert_eq!(normalised_cosine(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(normalised_cosine(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(normalised_cosine(&[], &[]), 0.0);
        assert_eq!(normalised_cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
