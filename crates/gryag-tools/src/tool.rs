//! The `Tool` trait, execution context, and result shape.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use gryag_context::{ContextStore, HybridRetriever};
use gryag_limits::FeatureQuota;
use gryag_memory::FactRepository;

/// Result of a tool execution, serialised back to the model as JSON.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub payload: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            is_error: false,
        }
    }

    /// The uniform error shape every tool returns on failure, so the model
    /// can apologise or retry with different arguments.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            payload: serde_json::json!({ "status": "error", "reason": reason.into() }),
            is_error: true,
        }
    }
}

/// Side-channel outputs a tool can leave for the pipeline to deliver after
/// the reply (generated images, polls).
#[derive(Debug, Default)]
pub struct ScratchState {
    /// (mime, base64 bytes) of images to attach to the reply.
    pub pending_images: Vec<(String, String)>,
    /// A poll to send after the reply text.
    pub pending_poll: Option<PendingPoll>,
}

#[derive(Debug, Clone)]
pub struct PendingPoll {
    pub question: String,
    pub options: Vec<String>,
    pub is_anonymous: bool,
}

/// Everything a handler may need, injected per request.
#[derive(Clone)]
pub struct ToolContext {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub user_id: i64,
    pub facts: FactRepository,
    pub turns: ContextStore,
    pub retriever: Arc<HybridRetriever>,
    pub http: reqwest::Client,
    pub search_api_key: Option<String>,
    pub image_api_key: Option<String>,
    pub image_quota: Option<Arc<FeatureQuota>>,
    /// (mime, base64) images attached to the current message, for edit_image.
    pub current_images: Vec<(String, String)>,
    /// Stored turn id of the current message; memory writes cite it as their
    /// evidence pointer.
    pub current_turn_id: Option<i64>,
    pub is_admin: bool,
    pub scratch: Arc<Mutex<ScratchState>>,
    pub now_ts: i64,
}

/// A callable tool. Declarations use only the primitive JSON-Schema subset
/// the provider's parser accepts (type, enum, array, object, description);
/// range constraints go into description text and are validated in the
/// handler.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// The full function declaration submitted to the model.
    fn declaration(&self) -> Value;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_shape_is_uniform() {
        let r = ToolResult::error("upstream timed out");
        assert!(r.is_error);
        assert_eq!(r.payload["status"], "error");
        assert_eq!(r.payload["reason"], "upstream timed out");
    }
}
