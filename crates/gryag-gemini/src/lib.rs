//! Gemini client: capability detection, request shaping with media filtering,
//! invocation with retry/key-rotation/circuit-breaking, the tool-call loop,
//! and cached embeddings.

pub mod breaker;
pub mod capabilities;
pub mod client;
pub mod media;
pub mod types;

pub use capabilities::ModelCapabilities;
pub use client::{GeminiClient, GenerateRequest, ToolExecutor};
pub use types::*;
