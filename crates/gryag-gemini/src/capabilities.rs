//! Model capability detection.
//!
//! Flags come from identifier patterns at construction time and may be
//! downgraded at runtime when the API rejects a request with a recognisable
//! capability error ("audio input is not enabled", "function calling is not
//! enabled", …). Downgrades are one-way for the process lifetime.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct ModelCapabilities {
    audio: AtomicBool,
    inline_video: AtomicBool,
    function_calling: AtomicBool,
    search_grounding: AtomicBool,
}

impl ModelCapabilities {
    /// Infer capabilities from a model identifier.
    ///
    /// The matrix is pattern-based: Gemma-family models are text-only with no
    /// tool support; flash/pro Gemini families support everything.
    pub fn detect(model: &str) -> Self {
        let id = model.to_lowercase();
        if id.contains("gemma") {
            return Self::with(false, false, false, false);
        }
        if id.contains("embedding") {
            return Self::with(false, false, false, false);
        }
        // gemini-*-flash / gemini-*-pro and default: full feature set.
        Self::with(true, true, true, true)
    }

    fn with(audio: bool, video: bool, functions: bool, search: bool) -> Self {
        Self {
            audio: AtomicBool::new(audio),
            inline_video: AtomicBool::new(video),
            function_calling: AtomicBool::new(functions),
            search_grounding: AtomicBool::new(search),
        }
    }

    pub fn supports_audio(&self) -> bool {
        self.audio.load(Ordering::Relaxed)
    }
    pub fn supports_inline_video(&self) -> bool {
        self.inline_video.load(Ordering::Relaxed)
    }
    pub fn supports_function_calling(&self) -> bool {
        self.function_calling.load(Ordering::Relaxed)
    }
    pub fn supports_search_grounding(&self) -> bool {
        self.search_grounding.load(Ordering::Relaxed)
    }

    /// Inspect an API error body; when it names a capability, disable that
    /// capability and report which one was downgraded.
    pub fn downgrade_from_error(&self, body: &str) -> Option<&'static str> {
        let lower = body.to_lowercase();
        if lower.contains("audio") && (lower.contains("not enabled") || lower.contains("not supported")) {
            self.audio.store(false, Ordering::Relaxed);
            return Some("audio");
        }
        if lower.contains("video") && (lower.contains("not enabled") || lower.contains("not supported")) {
            self.inline_video.store(false, Ordering::Relaxed);
            return Some("inline_video");
        }
        if lower.contains("function calling") && (lower.contains("not enabled") || lower.contains("not supported")) {
            self.function_calling.store(false, Ordering::Relaxed);
            return Some("function_calling");
        }
        if (lower.contains("search grounding") || lower.contains("google_search"))
            && (lower.contains("not enabled") || lower.contains("not supported"))
        {
            self.search_grounding.store(false, Ordering::Relaxed);
            return Some("search_grounding");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemma_family_is_text_only() {
        let caps = ModelCapabilities::detect("gemma-3-27b-it");
        assert!(!caps.supports_audio());
        assert!(!caps.supports_inline_video());
        assert!(!caps.supports_function_calling());
        assert!(!caps.supports_search_grounding());
    }

    #[test]
    fn flash_family_has_everything() {
        let caps = ModelCapabilities::detect("gemini-2.5-flash");
        assert!(caps.supports_audio());
        assert!(caps.supports_inline_video());
        assert!(caps.supports_function_calling());
        assert!(caps.supports_search_grounding());
    }

    #[test]
    fn runtime_downgrade_disables_audio() {
        let caps = ModelCapabilities::detect("gemini-2.5-flash");
        let hit = caps.downgrade_from_error("Audio input modality is not enabled for this model");
        assert_eq!(hit, Some("audio"));
        assert!(!caps.supports_audio());
        // Other flags untouched.
        assert!(caps.supports_function_calling());
    }

    #[test]
    fn runtime_downgrade_disables_function_calling() {
        let caps = ModelCapabilities::detect("gemini-2.5-flash");
        let hit = caps.downgrade_from_error("Function calling is not enabled for this model");
        assert_eq!(hit, Some("function_calling"));
        assert!(!caps.supports_function_calling());
    }

    #[test]
    fn unrelated_error_downgrades_nothing() {
        let caps = ModelCapabilities::detect("gemini-2.5-flash");
        assert_eq!(caps.downgrade_from_error("internal server error"), None);
        assert!(caps.supports_audio());
    }
}
