use figment::{providers::Env, Figment};
use serde::{Deserialize, Serialize};

use crate::error::{GryagError, Result};

/// Weights must sum to 1.0 within this slack.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Top-level settings, loaded once from the process environment.
///
/// Every field maps to an env var of the same name in SCREAMING_SNAKE_CASE
/// (`telegram_token` ← `TELEGRAM_TOKEN`). Comma-separated list vars stay raw
/// strings here; the typed accessors below split and parse them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // credentials
    pub telegram_token: String,
    /// Comma-separated list; rotated on key-level quota exhaustion.
    pub gemini_api_key: String,
    pub image_generation_api_key: Option<String>,
    pub search_api_key: Option<String>,
    pub weather_api_key: Option<String>,

    // identity
    #[serde(default)]
    pub admin_user_ids: String,
    pub allowed_chat_ids: Option<String>,
    #[serde(default = "default_bot_username")]
    pub bot_username: String,

    // limits
    #[serde(default = "default_rate_limit_per_user_per_hour")]
    pub rate_limit_per_user_per_hour: u32,
    #[serde(default = "default_command_cooldown_seconds")]
    pub command_cooldown_seconds: u64,
    #[serde(default = "bool_true")]
    pub enable_command_throttling: bool,
    #[serde(default = "default_image_generation_daily_limit")]
    pub image_generation_daily_limit: u32,
    #[serde(default = "default_image_generation_hourly_limit")]
    pub image_generation_hourly_limit: u32,

    // context
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,
    #[serde(default = "default_gemini_max_media_items")]
    pub gemini_max_media_items: usize,
    #[serde(default = "default_gemini_max_media_items_historical")]
    pub gemini_max_media_items_historical: usize,
    #[serde(default = "default_gemini_max_video_items")]
    pub gemini_max_video_items: usize,
    #[serde(default = "bool_true")]
    pub include_reply_excerpt: bool,
    #[serde(default = "default_reply_excerpt_max_chars")]
    pub reply_excerpt_max_chars: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Prepend the compact `[meta] …` block to stored turn text.
    #[serde(default = "bool_true")]
    pub enable_compact_conversation_format: bool,
    /// Include chat/thread ids in the compact block, not just user fields.
    #[serde(default = "bool_true")]
    pub compact_format_use_full_ids: bool,
    /// Unsealed turns before a long conversation is force-segmented.
    #[serde(default = "default_context_summary_threshold")]
    pub context_summary_threshold: usize,

    // retrieval weights — validated to sum to 1.0
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_temporal_weight")]
    pub temporal_weight: f64,
    #[serde(default = "default_temporal_decay_days")]
    pub temporal_decay_days: f64,

    // episodes
    #[serde(default = "default_episode_gap_seconds")]
    pub episode_gap_seconds: i64,
    #[serde(default = "default_episode_boundary_distance")]
    pub episode_boundary_distance: f64,
    #[serde(default = "default_episode_min_turns")]
    pub episode_min_turns: usize,
    #[serde(default = "default_episode_monitor_interval_seconds")]
    pub episode_monitor_interval_seconds: u64,

    // logging
    pub log_dir: Option<String>,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "bool_true")]
    pub enable_console_logging: bool,
    #[serde(default)]
    pub enable_file_logging: bool,

    // feature flags
    #[serde(default = "bool_true")]
    pub enable_multi_level_context: bool,
    #[serde(default = "bool_true")]
    pub enable_search_grounding: bool,
    #[serde(default)]
    pub enable_image_generation: bool,
    #[serde(default = "bool_true")]
    pub enable_hybrid_search: bool,
    #[serde(default = "bool_true")]
    pub enable_embedding_cache: bool,

    // model
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    #[serde(default = "default_gemini_embed_model")]
    pub gemini_embed_model: String,
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,

    // misc
    #[serde(default = "default_db_path")]
    pub db_path: String,
    pub donation_chat_id: Option<i64>,
    #[serde(default)]
    pub donation_interval_hours: u64,
    #[serde(default = "default_pipeline_timeout_seconds")]
    pub pipeline_timeout_seconds: u64,
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
    #[serde(default = "default_generation_concurrency")]
    pub generation_concurrency: usize,
    #[serde(default = "default_db_busy_timeout_ms")]
    pub db_busy_timeout_ms: u64,
}

impl Settings {
    /// Extract settings from the environment and validate them.
    ///
    /// Validation collects every violation before failing so a misconfigured
    /// deployment sees the full list in one pass.
    pub fn load() -> Result<Self> {
        let settings: Settings = Figment::new()
            .merge(Env::raw())
            .extract()
            .map_err(|e| GryagError::ConfigInvalid(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.telegram_token.trim().is_empty() {
            problems.push("TELEGRAM_TOKEN must be set".into());
        }
        if self.gemini_api_keys().is_empty() {
            problems.push("GEMINI_API_KEY must contain at least one key".into());
        }

        let sum = self.semantic_weight + self.keyword_weight + self.temporal_weight;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            problems.push(format!(
                "SEMANTIC_WEIGHT + KEYWORD_WEIGHT + TEMPORAL_WEIGHT must sum to 1.0 (got {sum:.3})"
            ));
        }
        for (name, w) in [
            ("SEMANTIC_WEIGHT", self.semantic_weight),
            ("KEYWORD_WEIGHT", self.keyword_weight),
            ("TEMPORAL_WEIGHT", self.temporal_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                problems.push(format!("{name} must be in [0, 1] (got {w})"));
            }
        }

        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            problems.push(format!("LOG_LEVEL '{}' is not a valid level", self.log_level));
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            problems.push(format!(
                "LOG_FORMAT '{}' must be 'text' or 'json'",
                self.log_format
            ));
        }
        if self.enable_file_logging && self.log_dir.is_none() {
            problems.push("ENABLE_FILE_LOGGING requires LOG_DIR".into());
        }
        if self.enable_image_generation && self.image_generation_api_key.is_none() {
            problems.push("ENABLE_IMAGE_GENERATION requires IMAGE_GENERATION_API_KEY".into());
        }
        if let Some(bad) = split_i64_list(&self.admin_user_ids).1.first() {
            problems.push(format!("ADMIN_USER_IDS contains a non-integer entry '{bad}'"));
        }
        if let Some(ref ids) = self.allowed_chat_ids {
            if let Some(bad) = split_i64_list(ids).1.first() {
                problems.push(format!("ALLOWED_CHAT_IDS contains a non-integer entry '{bad}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GryagError::ConfigInvalid(problems.join("; ")))
        }
    }

    pub fn gemini_api_keys(&self) -> Vec<String> {
        self.gemini_api_key
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn admin_ids(&self) -> Vec<i64> {
        split_i64_list(&self.admin_user_ids).0
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids().contains(&user_id)
    }

    /// `None` means no whitelist — every chat is allowed.
    pub fn allowed_chats(&self) -> Option<Vec<i64>> {
        self.allowed_chat_ids.as_deref().map(|s| split_i64_list(s).0)
    }

    pub fn chat_allowed(&self, chat_id: i64) -> bool {
        match self.allowed_chats() {
            Some(ids) => ids.contains(&chat_id),
            None => true,
        }
    }
}

/// Split a comma-separated integer list; returns (parsed, rejected-tokens).
fn split_i64_list(raw: &str) -> (Vec<i64>, Vec<String>) {
    let mut ok = Vec::new();
    let mut bad = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match token.parse::<i64>() {
            Ok(v) => ok.push(v),
            Err(_) => bad.push(token.to_string()),
        }
    }
    (ok, bad)
}

fn bool_true() -> bool {
    true
}
fn default_bot_username() -> String {
    "gryag_bot".to_string()
}
fn default_rate_limit_per_user_per_hour() -> u32 {
    20
}
fn default_command_cooldown_seconds() -> u64 {
    300
}
fn default_image_generation_daily_limit() -> u32 {
    10
}
fn default_image_generation_hourly_limit() -> u32 {
    3
}
fn default_max_turns() -> usize {
    50
}
fn default_context_token_budget() -> usize {
    8000
}
fn default_gemini_max_media_items() -> usize {
    28
}
fn default_gemini_max_media_items_historical() -> usize {
    5
}
fn default_gemini_max_video_items() -> usize {
    1
}
fn default_reply_excerpt_max_chars() -> usize {
    200
}
fn default_retention_days() -> u32 {
    90
}
fn default_context_summary_threshold() -> usize {
    30
}
fn default_log_retention_days() -> u32 {
    14
}
fn default_semantic_weight() -> f64 {
    0.5
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_temporal_weight() -> f64 {
    0.2
}
fn default_temporal_decay_days() -> f64 {
    7.0
}
fn default_episode_gap_seconds() -> i64 {
    1800
}
fn default_episode_boundary_distance() -> f64 {
    0.55
}
fn default_episode_min_turns() -> usize {
    6
}
fn default_episode_monitor_interval_seconds() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_gemini_embed_model() -> String {
    "text-embedding-004".to_string()
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_db_path() -> String {
    "./gryag.db".to_string()
}
fn default_pipeline_timeout_seconds() -> u64 {
    30
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_generation_concurrency() -> usize {
    8
}
fn default_db_busy_timeout_ms() -> u64 {
    5000
}
