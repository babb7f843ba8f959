//! The Gemini HTTP client.
//!
//! One client instance owns the key ring, the capability flags, the circuit
//! breaker, and the concurrency semaphores. `generate` runs the full tool
//! loop; `embed` consults the durable cache first and is non-fatal on error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use gryag_core::{telemetry, GryagError, Result};
use gryag_context::EmbeddingCache;

use crate::breaker::CircuitBreaker;
use crate::capabilities::ModelCapabilities;
use crate::media::{shape_contents, MediaLimits};
use crate::types::*;

/// Tool-loop iteration cap.
const MAX_TOOL_ITERATIONS: usize = 3;
/// Transient retry schedule per key.
const RETRY_BACKOFF_SECS: [u64; 3] = [1, 2, 4];

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// Executes model-requested function calls. Implemented by the tool
/// dispatcher; the client stays ignorant of individual tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Function declarations to submit with the request.
    fn declarations(&self) -> Vec<serde_json::Value>;
    /// Run one call, returning the JSON payload for the function response.
    async fn execute(&self, name: &str, args: serde_json::Value) -> serde_json::Value;
}

/// One generation request before shaping.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_instruction: String,
    pub contents: Vec<Content>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub enable_search_grounding: bool,
    /// Bot's remembered description of a video that may be dropped by the
    /// video cap (see the media shaping pass).
    pub dropped_video_description: Option<String>,
}

pub struct GeminiClient {
    http: reqwest::Client,
    keys: Vec<String>,
    key_index: AtomicUsize,
    model: String,
    embed_model: String,
    base_url: String,
    caps: ModelCapabilities,
    breaker: CircuitBreaker,
    media_limits: MediaLimits,
    embed_sem: Semaphore,
    generate_sem: Semaphore,
    embed_cache: Option<Arc<EmbeddingCache>>,
}

impl GeminiClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Vec<String>,
        model: String,
        embed_model: String,
        base_url: String,
        media_limits: MediaLimits,
        embed_concurrency: usize,
        generate_concurrency: usize,
        request_timeout: Duration,
        embed_cache: Option<Arc<EmbeddingCache>>,
    ) -> Result<Self> {
        if keys.is_empty() {
            return Err(GryagError::ConfigInvalid("no Gemini API keys".into()));
        }
        let caps = ModelCapabilities::detect(&model);
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GryagError::Internal(e.to_string()))?;
        Ok(Self {
            http,
            keys,
            key_index: AtomicUsize::new(0),
            model,
            embed_model,
            base_url,
            caps,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
            media_limits,
            embed_sem: Semaphore::new(embed_concurrency.max(1)),
            generate_sem: Semaphore::new(generate_concurrency.max(1)),
            embed_cache,
        })
    }

    pub fn capabilities(&self) -> &ModelCapabilities {
        &self.caps
    }

    pub fn circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Run a generation with the tool loop. Capability rejections trigger a
    /// one-shot recovery: the offending capability is disabled, media and
    /// tools are re-filtered, and the request is retried once.
    pub async fn generate(
        &self,
        request: &GenerateRequest,
        executor: Option<&dyn ToolExecutor>,
    ) -> Result<GenerationOutcome> {
        if self.breaker.is_open() {
            return Err(GryagError::LlmTransient("circuit breaker open".into()));
        }
        let _permit = self
            .generate_sem
            .acquire()
            .await
            .map_err(|_| GryagError::Internal("generate semaphore closed".into()))?;

        let started = Instant::now();
        match self.generate_once(request, executor).await {
            Ok(mut outcome) => {
                self.breaker.record_success();
                outcome.response_time_ms = started.elapsed().as_millis() as u64;
                Ok(outcome)
            }
            Err(GryagError::LlmCapability(body)) => {
                match self.caps.downgrade_from_error(&body) {
                    Some(flag) => {
                        info!(capability = flag, "capability rejected, retrying without it");
                        let mut outcome = self.generate_once(request, executor).await?;
                        self.breaker.record_success();
                        outcome.response_time_ms = started.elapsed().as_millis() as u64;
                        Ok(outcome)
                    }
                    None => {
                        self.breaker.record_failure();
                        Err(GryagError::LlmCapability(body))
                    }
                }
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn generate_once(
        &self,
        request: &GenerateRequest,
        executor: Option<&dyn ToolExecutor>,
    ) -> Result<GenerationOutcome> {
        // Shape a working copy: capability filter + media caps.
        let mut contents = request.contents.clone();
        shape_contents(
            &mut contents,
            &self.caps,
            &self.media_limits,
            request.dropped_video_description.as_deref(),
        );

        // Tools only when the model takes them.
        let declarations = match executor {
            Some(exec) if self.caps.supports_function_calling() => exec.declarations(),
            _ => Vec::new(),
        };
        let search = request.enable_search_grounding && self.caps.supports_search_grounding();

        let mut tools_used: Vec<String> = Vec::new();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;

        for iteration in 0..MAX_TOOL_ITERATIONS {
            let body = build_body(
                &request.system_instruction,
                &contents,
                &declarations,
                search,
                request.temperature,
                request.max_output_tokens,
            );
            let reply = self.call_generate(&body).await?;
            input_tokens += reply.input_tokens;
            output_tokens += reply.output_tokens;

            if reply.tool_calls.is_empty() {
                return Ok(GenerationOutcome {
                    text: reply.text,
                    tools_used,
                    input_tokens,
                    output_tokens,
                    response_time_ms: 0,
                });
            }
            let Some(exec) = executor else {
                // The model hallucinated a call we can't run; return its text.
                return Ok(GenerationOutcome {
                    text: reply.text,
                    tools_used,
                    input_tokens,
                    output_tokens,
                    response_time_ms: 0,
                });
            };

            debug!(iteration, calls = reply.tool_calls.len(), "executing tool calls");

            // Run this iteration's calls concurrently, then commit their
            // response parts in name-sorted order so replay is deterministic.
            let futures = reply.tool_calls.iter().map(|call| async {
                let result = exec.execute(&call.name, call.args.clone()).await;
                (call.name.clone(), call.args.clone(), result)
            });
            let mut results = futures_util::future::join_all(futures).await;
            results.sort_by(|a, b| a.0.cmp(&b.0));

            let mut model_parts = Vec::new();
            if !reply.text.is_empty() {
                model_parts.push(Part::Text(reply.text.clone()));
            }
            let mut response_parts = Vec::new();
            for (name, args, result) in results {
                tools_used.push(name.clone());
                model_parts.push(Part::FunctionCall {
                    name: name.clone(),
                    args,
                });
                response_parts.push(Part::FunctionResponse {
                    name,
                    response: result,
                });
            }
            contents.push(Content {
                role: ContentRole::Model,
                parts: model_parts,
            });
            contents.push(Content {
                role: ContentRole::User,
                parts: response_parts,
            });
        }

        warn!(max = MAX_TOOL_ITERATIONS, "tool loop hit the iteration cap");
        Ok(GenerationOutcome {
            text: String::new(),
            tools_used,
            input_tokens,
            output_tokens,
            response_time_ms: 0,
        })
    }

    /// Send one body through the key ring with transient retries.
    async fn call_generate(&self, body: &serde_json::Value) -> Result<GenerateReply> {
        let key_count = self.keys.len();
        let start = self.key_index.load(Ordering::Relaxed);
        let mut exhausted_keys = 0usize;
        let mut last_transient = String::new();

        for offset in 0..key_count {
            let idx = (start + offset) % key_count;
            let key = &self.keys[idx];

            for (attempt, &backoff) in RETRY_BACKOFF_SECS.iter().enumerate() {
                match self.post_generate(key, body).await {
                    Ok(reply) => {
                        self.key_index.store(idx, Ordering::Relaxed);
                        return Ok(reply);
                    }
                    Err(CallError::Network(e)) => {
                        last_transient = e;
                        telemetry::incr("llm_retries");
                        if attempt + 1 < RETRY_BACKOFF_SECS.len() {
                            sleep_with_jitter(backoff).await;
                        }
                    }
                    Err(CallError::Api { status, body: text }) => {
                        match classify_failure(status, &text) {
                            FailureClass::Transient => {
                                last_transient = text;
                                telemetry::incr("llm_retries");
                                if attempt + 1 < RETRY_BACKOFF_SECS.len() {
                                    sleep_with_jitter(backoff).await;
                                }
                            }
                            FailureClass::KeyQuota => {
                                warn!(key_index = idx, "key quota exhausted, rotating");
                                exhausted_keys += 1;
                                break;
                            }
                            FailureClass::SafetyBlocked => {
                                return Err(GryagError::LlmSafety(text));
                            }
                            FailureClass::Capability => {
                                return Err(GryagError::LlmCapability(text));
                            }
                            FailureClass::InvalidArgument => {
                                return Err(GryagError::Internal(format!(
                                    "invalid argument: {text}"
                                )));
                            }
                            FailureClass::Network | FailureClass::Unknown => {
                                return Err(GryagError::LlmTransient(text));
                            }
                        }
                    }
                }
            }
        }

        if exhausted_keys == key_count {
            Err(GryagError::LlmQuota)
        } else {
            Err(GryagError::LlmTransient(last_transient))
        }
    }

    async fn post_generate(
        &self,
        key: &str,
        body: &serde_json::Value,
    ) -> std::result::Result<GenerateReply, CallError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, key
        );
        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| CallError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::Api { status, body: text });
        }
        let raw: RawResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Network(e.to_string()))?;
        parse_reply(raw).map_err(|reason| CallError::Api {
            status: 200,
            body: reason,
        })
    }

    /// Embed a text. Cache-first; every failure is non-fatal and yields
    /// `None` so downstream semantic scoring degrades to zero.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        if text.is_empty() {
            return None;
        }
        if let Some(cache) = &self.embed_cache {
            match cache.get(text) {
                Ok(Some(hit)) => return Some(hit),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "embedding cache read failed"),
            }
        }

        let _permit = self.embed_sem.acquire().await.ok()?;
        let key = &self.keys[self.key_index.load(Ordering::Relaxed) % self.keys.len()];
        let url = format!(
            "{}/v1beta/models/{}:embedContent?key={}",
            self.base_url, self.embed_model, key
        );
        let body = serde_json::json!({
            "model": format!("models/{}", self.embed_model),
            "content": { "parts": [{ "text": text }] },
        });

        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "embedContent request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(status = resp.status().as_u16(), "embedContent returned an error");
            return None;
        }
        let raw: RawEmbedResponse = match resp.json().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "embedContent parse failed");
                return None;
            }
        };
        let values = raw.embedding.map(|e| e.values).unwrap_or_default();
        if values.is_empty() {
            return None;
        }
        if let Some(cache) = &self.embed_cache {
            if let Err(e) = cache.put(text, &values) {
                warn!(error = %e, "embedding cache write failed");
            }
        }
        Some(values)
    }
}

enum CallError {
    Network(String),
    Api { status: u16, body: String },
}

async fn sleep_with_jitter(base_secs: u64) {
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    tokio::time::sleep(Duration::from_millis(base_secs * 1000 + jitter_ms)).await;
}

/// Build the `generateContent` body.
pub(crate) fn build_body(
    system_instruction: &str,
    contents: &[Content],
    declarations: &[serde_json::Value],
    search_grounding: bool,
    temperature: f32,
    max_output_tokens: u32,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "system_instruction": { "parts": [{ "text": system_instruction }] },
        "contents": contents.iter().map(Content::to_json).collect::<Vec<_>>(),
        "generationConfig": {
            "temperature": temperature,
            "maxOutputTokens": max_output_tokens,
        },
        "safetySettings": [
            { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_ONLY_HIGH" },
            { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_ONLY_HIGH" },
            { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_ONLY_HIGH" },
            { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_ONLY_HIGH" },
        ],
    });

    let mut tools = Vec::new();
    if !declarations.is_empty() {
        tools.push(serde_json::json!({ "function_declarations": declarations }));
    }
    if search_grounding && declarations.is_empty() {
        // google_search cannot be combined with function declarations.
        tools.push(serde_json::json!({ "google_search": {} }));
    }
    if !tools.is_empty() {
        body["tools"] = serde_json::Value::Array(tools);
    }
    body
}

/// Flatten a raw response into text + tool calls; a prompt-level block
/// surfaces as an error string.
pub(crate) fn parse_reply(raw: RawResponse) -> std::result::Result<GenerateReply, String> {
    if let Some(feedback) = &raw.prompt_feedback {
        if let Some(reason) = &feedback.block_reason {
            return Err(format!("blocked for safety: {reason}"));
        }
    }
    let usage = raw.usage_metadata.as_ref();
    let mut reply = GenerateReply {
        input_tokens: usage.map(|u| u.prompt_token_count).unwrap_or(0),
        output_tokens: usage.map(|u| u.candidates_token_count).unwrap_or(0),
        ..GenerateReply::default()
    };

    let Some(candidate) = raw.candidates.into_iter().next() else {
        return Err("no candidates in response".into());
    };
    reply.finish_reason = candidate.finish_reason.unwrap_or_default();

    if let Some(content) = candidate.content {
        let mut texts = Vec::new();
        for part in content.parts {
            if let Some(text) = part.text {
                texts.push(text);
            }
            if let Some(call) = part.function_call {
                reply.tool_calls.push(ToolCall {
                    name: call.name,
                    args: call.args,
                });
            }
        }
        reply.text = texts.join("");
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> std::result::Result<GenerateReply, String> {
        parse_reply(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn parse_text_reply() {
        let reply = parse(
            r#"{
                "candidates": [{
                    "content": { "parts": [{ "text": "привіт!" }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 120, "candidatesTokenCount": 8 }
            }"#,
        )
        .unwrap();
        assert_eq!(reply.text, "привіт!");
        assert_eq!(reply.finish_reason, "STOP");
        assert_eq!(reply.input_tokens, 120);
        assert_eq!(reply.output_tokens, 8);
        assert!(reply.tool_calls.is_empty());
    }

    #[test]
    fn parse_function_calls() {
        let reply = parse(
            r#"{
                "candidates": [{
                    "content": { "parts": [
                        { "functionCall": { "name": "weather", "args": { "city": "kyiv" } } },
                        { "functionCall": { "name": "currency", "args": {} } }
                    ]},
                    "finishReason": "STOP"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].name, "weather");
        assert_eq!(reply.tool_calls[0].args["city"], "kyiv");
    }

    #[test]
    fn parse_prompt_block_is_error() {
        let err = parse(r#"{ "candidates": [], "promptFeedback": { "blockReason": "SAFETY" } }"#)
            .unwrap_err();
        assert!(err.contains("SAFETY"));
    }

    #[test]
    fn parse_empty_candidates_is_error() {
        assert!(parse(r#"{ "candidates": [] }"#).is_err());
    }

    #[test]
    fn body_includes_declarations_when_present() {
        let decl = serde_json::json!({ "name": "weather", "parameters": { "type": "object" } });
        let body = build_body("persona", &[], &[decl], false, 0.8, 1024);
        assert_eq!(body["tools"][0]["function_declarations"][0]["name"], "weather");
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "persona");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn body_omits_tools_when_none() {
        let body = build_body("persona", &[], &[], false, 0.8, 1024);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn search_grounding_only_without_declarations() {
        let body = build_body("p", &[], &[], true, 0.8, 256);
        assert!(body["tools"][0].get("google_search").is_some());
        let decl = serde_json::json!({ "name": "weather" });
        let body = build_body("p", &[], &[decl], true, 0.8, 256);
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
        assert!(body["tools"][0].get("function_declarations").is_some());
    }

    #[test]
    fn contents_serialise_roles() {
        let contents = vec![Content {
            role: ContentRole::User,
            parts: vec![Part::Text("hi".into())],
        }];
        let body = build_body("p", &contents, &[], false, 0.8, 256);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
    }
}
