//! Static tool registry and the per-request dispatcher.
//!
//! The registry is populated once at startup; the dispatcher pairs it with a
//! request's `ToolContext` and implements the LLM client's `ToolExecutor`.
//! Every invocation runs through a tracer that records latency and
//! success/failure telemetry.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use gryag_core::telemetry;
use gryag_gemini::ToolExecutor;

use crate::calculator::Calculator;
use crate::external::{Currency, EditImage, GenerateImage, Polls, SearchWeb, Weather};
use crate::memory_tools::{ForgetFact, RecallFacts, RememberFact, UpdateFact};
use crate::search::SearchMessages;
use crate::tool::{Tool, ToolContext, ToolResult};

pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn declarations(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.declaration()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the full registry. Memory tools are always present; image
/// generation joins only when enabled.
pub fn build_registry(enable_image_generation: bool) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(RememberFact));
    registry.register(Arc::new(RecallFacts));
    registry.register(Arc::new(UpdateFact));
    registry.register(Arc::new(ForgetFact));
    registry.register(Arc::new(SearchMessages));
    registry.register(Arc::new(Calculator));
    registry.register(Arc::new(Weather));
    registry.register(Arc::new(Currency));
    registry.register(Arc::new(SearchWeb));
    registry.register(Arc::new(Polls));
    if enable_image_generation {
        registry.register(Arc::new(GenerateImage));
        registry.register(Arc::new(EditImage));
    }
    Arc::new(registry)
}

/// Per-request executor handed to the Gemini client's tool loop.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    ctx: ToolContext,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, ctx: ToolContext) -> Self {
        Self { registry, ctx }
    }

    async fn dispatch(&self, name: &str, args: Value) -> ToolResult {
        let Some(tool) = self.registry.get(name) else {
            warn!(tool = name, "model requested an unknown tool");
            return ToolResult::error(format!("unknown tool: {name}"));
        };

        let started = Instant::now();
        let result = tool.execute(args, &self.ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if result.is_error {
            telemetry::incr(&format!("tool_err_{name}"));
            warn!(tool = name, elapsed_ms, "tool failed");
        } else {
            telemetry::incr(&format!("tool_ok_{name}"));
            debug!(tool = name, elapsed_ms, "tool ok");
        }
        result
    }
}

#[async_trait]
impl ToolExecutor for ToolDispatcher {
    fn declarations(&self) -> Vec<Value> {
        self.registry.declarations()
    }

    async fn execute(&self, name: &str, args: Value) -> Value {
        self.dispatch(name, args).await.payload
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use gryag_context::{ContextStore, HybridRetriever, RetrievalWeights};
    use gryag_memory::FactRepository;
    use gryag_store::Storage;

    use crate::tool::ScratchState;

    /// Shared fixture: an in-memory database behind a full ToolContext.
    pub(crate) fn test_context() -> ToolContext {
        let storage = Storage::open_in_memory().unwrap();
        let turns = ContextStore::new(storage.clone());
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
        ToolContext {
            chat_id: -100,
            thread_id: None,
            user_id: 42,
            facts: FactRepository::new(storage.clone()),
            turns,
            retriever: Arc::new(retriever),
            http: reqwest::Client::new(),
            search_api_key: None,
            image_api_key: None,
            image_quota: None,
            current_images: Vec::new(),
            current_turn_id: None,
            is_admin: false,
            scratch: Arc::new(Mutex::new(ScratchState::default())),
            now_ts: 1_700_000_000,
        }
    }

    #[test]
    fn registry_contains_memory_tools_always() {
        let registry = build_registry(false);
        for name in ["remember_fact", "recall_facts", "update_fact", "forget_fact"] {
            assert!(registry.get(name).is_some(), "missing {name}");
        }
        assert!(registry.get("generate_image").is_none());
        assert!(registry.get("edit_image").is_none());
        let with_images = build_registry(true);
        assert!(with_images.get("generate_image").is_some());
        assert!(with_images.get("edit_image").is_some());
    }

    #[test]
    fn declarations_have_name_and_parameters() {
        let registry = build_registry(true);
        for decl in registry.declarations() {
            assert!(decl["name"].is_string(), "{decl}");
            assert!(decl["parameters"]["type"].is_string(), "{decl}");
        }
    }

    #[tokio::test]
    async fn dispatcher_traces_and_reports_unknown_tools() {
        let dispatcher = ToolDispatcher::new(build_registry(false), test_context());
        let payload = dispatcher.execute("no_such_tool", Value::Null).await;
        assert_eq!(payload["status"], "error");
    }

    #[tokio::test]
    async fn dispatcher_runs_a_real_tool_and_bumps_telemetry() {
        let dispatcher = ToolDispatcher::new(build_registry(false), test_context());
        let before = telemetry::get("tool_ok_calculator");
        let payload = dispatcher
            .execute("calculator", serde_json::json!({ "expression": "2+2" }))
            .await;
        assert_eq!(payload["result"], 4.0);
        assert!(telemetry::get("tool_ok_calculator") > before);
    }
}
