//! Conversation context: the append-only turn log, the embedding cache, the
//! hybrid retriever, the multi-level context assembler, and episodic memory.

pub mod assembler;
pub mod embed_cache;
pub mod episodes;
pub mod meta;
pub mod retriever;
pub mod tokens;
pub mod turns;
pub mod types;

pub use assembler::{AssembledContext, ContextAssembler};
pub use embed_cache::EmbeddingCache;
pub use episodes::{EpisodeMonitor, EpisodeStore, EpisodeSummarizer};
pub use retriever::{HybridRetriever, RetrievalWeights, ScoredTurn};
pub use turns::ContextStore;
pub use types::*;
