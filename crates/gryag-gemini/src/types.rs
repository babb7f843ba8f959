//! Wire-level request/response types for the `generateContent` and
//! `embedContent` endpoints, plus terminal-error classification.

use serde::Deserialize;

use gryag_context::{MediaData, MediaPart};

/// One role-tagged entry in `contents`.
#[derive(Debug, Clone)]
pub struct Content {
    pub role: ContentRole,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRole {
    User,
    Model,
}

impl ContentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

/// One part of a content entry.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    InlineData { mime: String, data: String },
    FileData { mime: String, uri: String },
    FunctionCall { name: String, args: serde_json::Value },
    FunctionResponse { name: String, response: serde_json::Value },
}

impl Part {
    pub fn from_media(media: &MediaPart) -> Self {
        match &media.data {
            MediaData::Base64(b64) => Part::InlineData {
                mime: media.mime.clone(),
                data: b64.clone(),
            },
            MediaData::FileUri(uri) => Part::FileData {
                mime: media.mime.clone(),
                uri: uri.clone(),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Part::Text(text) => serde_json::json!({ "text": text }),
            Part::InlineData { mime, data } => serde_json::json!({
                "inline_data": { "mime_type": mime, "data": data }
            }),
            Part::FileData { mime, uri } => serde_json::json!({
                "file_data": { "mime_type": mime, "file_uri": uri }
            }),
            Part::FunctionCall { name, args } => serde_json::json!({
                "functionCall": { "name": name, "args": args }
            }),
            Part::FunctionResponse { name, response } => serde_json::json!({
                "functionResponse": { "name": name, "response": response }
            }),
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, Part::InlineData { .. } | Part::FileData { .. })
    }

    pub fn is_video(&self) -> bool {
        match self {
            Part::InlineData { mime, .. } | Part::FileData { mime, .. } => {
                mime.starts_with("video/")
            }
            _ => false,
        }
    }

    pub fn is_audio(&self) -> bool {
        match self {
            Part::InlineData { mime, .. } | Part::FileData { mime, .. } => {
                mime.starts_with("audio/")
            }
            _ => false,
        }
    }

    pub fn mime(&self) -> Option<&str> {
        match self {
            Part::InlineData { mime, .. } | Part::FileData { mime, .. } => Some(mime),
            _ => None,
        }
    }
}

impl Content {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "role": self.role.as_str(),
            "parts": self.parts.iter().map(Part::to_json).collect::<Vec<_>>(),
        })
    }
}

/// A function call requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
}

/// Parsed `generateContent` response.
#[derive(Debug, Clone, Default)]
pub struct GenerateReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Final pipeline-facing result of one generation (after the tool loop).
#[derive(Debug, Clone, Default)]
pub struct GenerationOutcome {
    pub text: String,
    pub tools_used: Vec<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub response_time_ms: u64,
}

// --- raw response deserialization -------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct RawResponse {
    #[serde(default)]
    pub candidates: Vec<RawCandidate>,
    #[serde(rename = "usageMetadata")]
    pub usage_metadata: Option<RawUsage>,
    #[serde(rename = "promptFeedback")]
    pub prompt_feedback: Option<RawPromptFeedback>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawPromptFeedback {
    #[serde(rename = "blockReason")]
    pub block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawCandidate {
    pub content: Option<RawContent>,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawContent {
    #[serde(default)]
    pub parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawPart {
    pub text: Option<String>,
    #[serde(rename = "functionCall")]
    pub function_call: Option<RawFunctionCall>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawUsage {
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    pub candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEmbedResponse {
    pub embedding: Option<RawEmbedding>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEmbedding {
    #[serde(default)]
    pub values: Vec<f32>,
}

// --- error classification ----------------------------------------------------

/// Terminal classification of an API failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Key-level exhaustion — rotate to the next key.
    KeyQuota,
    /// Retry with backoff on the same key.
    Transient,
    /// Content blocked by safety filters.
    SafetyBlocked,
    /// The model rejects a capability; recoverable by filtering and retrying.
    Capability,
    InvalidArgument,
    Network,
    Unknown,
}

/// Classify an HTTP status + body into the failure taxonomy.
pub fn classify_failure(status: u16, body: &str) -> FailureClass {
    let lower = body.to_lowercase();
    match status {
        429 => {
            // Per-key daily quota vs momentary rate limit: exhausted quotas
            // mention quota/billing and do not recover within the request.
            if lower.contains("quota") || lower.contains("resource_exhausted") {
                FailureClass::KeyQuota
            } else {
                FailureClass::Transient
            }
        }
        500 | 502 | 503 | 504 => FailureClass::Transient,
        400 => {
            if lower.contains("not enabled") || lower.contains("not supported") {
                FailureClass::Capability
            } else if lower.contains("safety") || lower.contains("blocked") {
                FailureClass::SafetyBlocked
            } else {
                FailureClass::InvalidArgument
            }
        }
        403 => {
            if lower.contains("quota") {
                FailureClass::KeyQuota
            } else {
                FailureClass::Unknown
            }
        }
        _ => {
            if lower.contains("overloaded") || lower.contains("unavailable") {
                FailureClass::Transient
            } else if lower.contains("safety") || lower.contains("blocked") {
                // Prompt-level blocks arrive with HTTP 200 and a block reason.
                FailureClass::SafetyBlocked
            } else {
                FailureClass::Unknown
            }
        }
    }
}
