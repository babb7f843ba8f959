//! LLM-backed summarisers: episode summaries and user-profile summaries.
//! Both are best-effort; callers have heuristic fallbacks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use gryag_context::{EpisodeSummarizer, EpisodeSummary, Turn};
use gryag_gemini::{Content, ContentRole, GeminiClient, GenerateRequest, Part};
use gryag_memory::Fact;

pub struct GeminiSummarizer {
    client: Arc<GeminiClient>,
}

impl GeminiSummarizer {
    pub fn new(client: Arc<GeminiClient>) -> Self {
        Self { client }
    }

    async fn complete(&self, system: &str, prompt: String) -> Option<String> {
        if self.client.circuit_open() {
            return None;
        }
        let request = GenerateRequest {
            system_instruction: system.to_string(),
            contents: vec![Content {
                role: ContentRole::User,
                parts: vec![Part::Text(prompt)],
            }],
            temperature: 0.3,
            max_output_tokens: 512,
            enable_search_grounding: false,
            dropped_video_description: None,
        };
        match self.client.generate(&request, None).await {
            Ok(outcome) if !outcome.text.is_empty() => Some(outcome.text),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "summarisation call failed");
                None
            }
        }
    }

    /// Summarise a user from their stored facts. `None` on any failure.
    pub async fn profile_summary(&self, display_name: &str, facts: &[Fact]) -> Option<String> {
        if facts.is_empty() {
            return None;
        }
        let mut lines = String::new();
        for fact in facts.iter().take(30) {
            lines.push_str(&format!("- {} {}: {}\n", fact.category, fact.key, fact.value));
        }
        let prompt = format!(
            "Відомі факти про користувача {display_name}:\n{lines}\n\
             Склади короткий (2-3 речення) портрет цієї людини українською."
        );
        self.complete("Ти стислий і точний асистент.", prompt).await
    }
}

#[async_trait]
impl EpisodeSummarizer for GeminiSummarizer {
    async fn summarize(&self, turns: &[Turn]) -> Option<EpisodeSummary> {
        let mut transcript = String::new();
        for turn in turns.iter().take(60) {
            let text: String = turn.text.chars().take(300).collect();
            transcript.push_str(&format!("[{}] {}\n", turn.user_id, text));
        }
        let prompt = format!(
            "Ось фрагмент групової розмови:\n{transcript}\n\
             Відповідай СУВОРО одним JSON-обʼєктом:\n\
             {{\"topic\": \"...\", \"summary\": \"...\", \"tags\": [\"...\"], \
               \"importance\": 0.0, \"valence\": \"positive|negative|mixed|neutral\"}}"
        );
        let raw = self
            .complete("Ти підсумовуєш розмови. Відповідаєш лише JSON.", prompt)
            .await?;
        parse_episode_json(&raw)
    }
}

/// Tolerant parse: accepts the JSON object anywhere in the model output.
fn parse_episode_json(raw: &str) -> Option<EpisodeSummary> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    let value: serde_json::Value = serde_json::from_str(&raw[start..=end]).ok()?;
    let summary = value["summary"].as_str()?.to_string();
    let topic = value["topic"].as_str().unwrap_or("").to_string();
    if summary.is_empty() {
        return None;
    }
    Some(EpisodeSummary {
        summary,
        topic,
        tags: value["tags"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        importance: value["importance"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0),
        emotional_valence: value["valence"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(gryag_context::EmotionalValence::Neutral),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let s = parse_episode_json(
            r#"{"topic": "deploys", "summary": "they fixed CI", "tags": ["ci"], "importance": 0.8, "valence": "positive"}"#,
        )
        .unwrap();
        assert_eq!(s.topic, "deploys");
        assert_eq!(s.tags, vec!["ci"]);
        assert!((s.importance - 0.8).abs() < 1e-9);
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let s = parse_episode_json(
            "Ось підсумок:\n```json\n{\"topic\": \"t\", \"summary\": \"s\"}\n```",
        )
        .unwrap();
        assert_eq!(s.summary, "s");
        assert_eq!(
            s.emotional_valence,
            gryag_context::EmotionalValence::Neutral
        );
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_episode_json("не json зовсім").is_none());
        assert!(parse_episode_json("{\"topic\": \"t\"}").is_none()); // no summary
    }
}
