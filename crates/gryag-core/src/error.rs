use thiserror::Error;

#[derive(Debug, Error)]
pub enum GryagError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Input rejected: {0}")]
    InputRejected(&'static str),

    #[error("Throttled, retry after {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("LLM quota exhausted on all keys")]
    LlmQuota,

    #[error("LLM capability error: {0}")]
    LlmCapability(String),

    #[error("LLM safety block: {0}")]
    LlmSafety(String),

    #[error("LLM transient error: {0}")]
    LlmTransient(String),

    #[error("Tool '{tool}' failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("External HTTP error: {0}")]
    ExternalHttp(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GryagError {
    /// Short classification code used in logs and telemetry labels.
    pub fn code(&self) -> &'static str {
        match self {
            GryagError::ConfigInvalid(_) => "config_invalid",
            GryagError::InputRejected(_) => "input_rejected",
            GryagError::Throttled { .. } => "throttled",
            GryagError::Storage(_) => "storage_error",
            GryagError::LlmQuota => "llm_quota",
            GryagError::LlmCapability(_) => "llm_capability",
            GryagError::LlmSafety(_) => "llm_safety",
            GryagError::LlmTransient(_) => "llm_transient",
            GryagError::ToolFailed { .. } => "tool_failed",
            GryagError::ExternalHttp(_) => "external_http",
            GryagError::Serialization(_) => "internal_bug",
            GryagError::Internal(_) => "internal_bug",
        }
    }

    /// Whether the user should see a distinct message rather than the generic apology.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            GryagError::Throttled { .. }
                | GryagError::LlmQuota
                | GryagError::LlmSafety(_)
                | GryagError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GryagError>;
