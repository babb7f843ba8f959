//! The startup-phase service container.
//!
//! Built once in `main`, then shared behind an `Arc`; each pipeline step
//! receives the subset it needs explicitly rather than digging through
//! per-request state.

use std::sync::Arc;
use std::time::Duration;

use gryag_context::{
    assembler::AssemblerConfig, ContextAssembler, ContextStore, EmbeddingCache, EpisodeMonitor,
    EpisodeStore, HybridRetriever, RetrievalWeights,
};
use gryag_context::episodes::EpisodeConfig;
use gryag_gemini::media::MediaLimits;
use gryag_gemini::GeminiClient;
use gryag_limits::{ChatLocks, CommandCooldown, FeatureQuota, UserRateLimiter};
use gryag_memory::{FactRepository, ProfileRepository, PromptStore};
use gryag_store::Storage;
use gryag_tools::{build_registry, ToolRegistry};

use gryag_core::Settings;

use crate::learner::FactLearner;

pub struct BotServices {
    pub settings: Settings,
    pub storage: Storage,
    pub turns: ContextStore,
    pub facts: FactRepository,
    pub profiles: ProfileRepository,
    pub prompts: PromptStore,
    pub episodes: EpisodeStore,
    pub monitor: EpisodeMonitor,
    pub assembler: ContextAssembler,
    pub retriever: Arc<HybridRetriever>,
    pub gemini: Arc<GeminiClient>,
    pub registry: Arc<ToolRegistry>,
    pub user_limiter: UserRateLimiter,
    pub cooldown: CommandCooldown,
    pub image_quota: Arc<FeatureQuota>,
    pub locks: ChatLocks,
    pub http: reqwest::Client,
    pub learner: FactLearner,
    /// Last throttle-notice timestamp per user (debounce).
    pub rate_warned: dashmap::DashMap<i64, i64>,
}

impl BotServices {
    pub fn build(settings: Settings) -> anyhow::Result<Self> {
        let storage = Storage::open(&settings.db_path, settings.db_busy_timeout_ms)?;

        let turns = ContextStore::new(storage.clone());
        let facts = FactRepository::new(storage.clone());
        let profiles = ProfileRepository::new(storage.clone());
        let prompts = PromptStore::new(storage.clone());
        let episodes = EpisodeStore::new(storage.clone());

        let weights = RetrievalWeights {
            semantic: settings.semantic_weight,
            keyword: settings.keyword_weight,
            temporal: settings.temporal_weight,
            decay_days: settings.temporal_decay_days,
        };
        let retriever = Arc::new(HybridRetriever::new(turns.clone(), weights)?);
        let retriever_for_assembler = HybridRetriever::new(turns.clone(), weights)?;

        let assembler = ContextAssembler::new(
            turns.clone(),
            facts.clone(),
            episodes.clone(),
            retriever_for_assembler,
            AssemblerConfig {
                token_budget: settings.context_token_budget,
                recent_turns: settings.max_turns,
                hybrid_enabled: settings.enable_hybrid_search,
                ..AssemblerConfig::default()
            },
        );

        let monitor = EpisodeMonitor::new(
            turns.clone(),
            episodes.clone(),
            EpisodeConfig {
                gap_seconds: settings.episode_gap_seconds,
                boundary_distance: settings.episode_boundary_distance,
                min_turns: settings.episode_min_turns,
                max_span: settings.context_summary_threshold,
            },
        );

        let embed_cache = if settings.enable_embedding_cache {
            Some(Arc::new(EmbeddingCache::new(
                storage.clone(),
                gryag_context::embed_cache::DEFAULT_CAPACITY,
            )))
        } else {
            None
        };

        let gemini = Arc::new(GeminiClient::new(
            settings.gemini_api_keys(),
            settings.gemini_model.clone(),
            settings.gemini_embed_model.clone(),
            settings.gemini_base_url.clone(),
            MediaLimits {
                total: settings.gemini_max_media_items,
                historical: settings.gemini_max_media_items_historical,
                videos: settings.gemini_max_video_items,
            },
            settings.embed_concurrency,
            settings.generation_concurrency,
            Duration::from_secs(settings.pipeline_timeout_seconds),
            embed_cache,
        )?);

        let image_quota = Arc::new(FeatureQuota::new(
            storage.clone(),
            "image_generation",
            settings.image_generation_hourly_limit,
            settings.image_generation_daily_limit,
        ));

        let registry = build_registry(settings.enable_image_generation);

        Ok(Self {
            user_limiter: UserRateLimiter::new(settings.rate_limit_per_user_per_hour),
            cooldown: CommandCooldown::new(
                settings.command_cooldown_seconds,
                settings.enable_command_throttling,
            ),
            locks: ChatLocks::new(Duration::from_secs(1800)),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()?,
            learner: FactLearner::new(facts.clone()),
            rate_warned: dashmap::DashMap::new(),
            settings,
            storage,
            turns,
            facts,
            profiles,
            prompts,
            episodes,
            monitor,
            assembler,
            retriever,
            gemini,
            registry,
            image_quota,
        })
    }

    pub fn now_ts(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Per-request tool context for the dispatcher.
    pub fn tool_context(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        user_id: i64,
        current_images: Vec<(String, String)>,
        current_turn_id: Option<i64>,
    ) -> gryag_tools::ToolContext {
        gryag_tools::ToolContext {
            chat_id,
            thread_id,
            user_id,
            facts: self.facts.clone(),
            turns: self.turns.clone(),
            retriever: Arc::clone(&self.retriever),
            http: self.http.clone(),
            search_api_key: self.settings.search_api_key.clone(),
            image_api_key: self.settings.image_generation_api_key.clone(),
            image_quota: Some(Arc::clone(&self.image_quota)),
            current_images,
            current_turn_id,
            is_admin: self.settings.is_admin(user_id),
            scratch: Arc::new(std::sync::Mutex::new(gryag_tools::ScratchState::default())),
            now_ts: self.now_ts(),
        }
    }
}
