//! Best-effort fact extraction from user messages.
//!
//! Fired after the reply is sent, throttled per user so a chatty thread does
//! not hammer the fact store. Pattern-based: first-person statements in
//! Ukrainian and English become low-to-mid-confidence facts; the model's own
//! memory tools remain the high-confidence write path.

use std::sync::OnceLock;

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use gryag_memory::{EntityType, FactCategory, FactRepository};

/// Minimum seconds between extractions for one user.
const EXTRACT_THROTTLE_SECS: i64 = 60;

struct Pattern {
    regex: Regex,
    category: FactCategory,
    key: &'static str,
    confidence: f64,
}

fn patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let make = |re: &str, category, key, confidence| Pattern {
            regex: Regex::new(re).expect("static pattern"),
            category,
            key,
            confidence,
        };
        vec![
            make(
                r"(?i)\bмене звати\s+([\p{L}'’-]+)",
                FactCategory::Personal,
                "name",
                0.7,
            ),
            make(
                r"(?i)\bmy name is\s+([\p{L}'’-]+)",
                FactCategory::Personal,
                "name",
                0.7,
            ),
            make(
                r"(?i)\bя (?:живу|мешкаю) (?:в|у)\s+([\p{L}'’-]+)",
                FactCategory::Personal,
                "location",
                0.6,
            ),
            make(
                r"(?i)\bi live in\s+([\p{L}'’ -]+)",
                FactCategory::Personal,
                "location",
                0.6,
            ),
            make(
                r"(?i)\bя з\s+([\p{L}'’-]+)",
                FactCategory::Personal,
                "origin",
                0.5,
            ),
            make(
                r"(?i)\bя працюю\s+([\p{L}'’ -]+)",
                FactCategory::Personal,
                "occupation",
                0.5,
            ),
            make(
                r"(?i)\bя люблю\s+([\p{L}'’ -]+)",
                FactCategory::Preference,
                "likes",
                0.4,
            ),
            make(
                r"(?i)\bя ненавиджу\s+([\p{L}'’ -]+)",
                FactCategory::Preference,
                "dislikes",
                0.4,
            ),
            make(
                r"(?i)\bя пишу на\s+([\p{L}#+'’-]+)",
                FactCategory::Skill,
                "programming language",
                0.5,
            ),
        ]
    })
}

/// Candidate facts extracted from one message.
pub fn extract_facts(text: &str) -> Vec<(FactCategory, &'static str, String, f64)> {
    let mut out = Vec::new();
    for pattern in patterns() {
        if let Some(caps) = pattern.regex.captures(text) {
            if let Some(m) = caps.get(1) {
                let value = m.as_str().trim().trim_end_matches(['.', ',', '!']).to_string();
                if !value.is_empty() && value.chars().count() <= 60 {
                    out.push((pattern.category, pattern.key, value, pattern.confidence));
                }
            }
        }
    }
    out
}

pub struct FactLearner {
    facts: FactRepository,
    last_run: DashMap<i64, i64>,
}

impl FactLearner {
    pub fn new(facts: FactRepository) -> Self {
        Self {
            facts,
            last_run: DashMap::new(),
        }
    }

    /// Extract and store facts from a message, throttled per user.
    /// `source_turn_id` is the stored turn the message landed in; facts cite
    /// it so pruning keeps their evidence.
    pub fn learn_from(
        &self,
        chat_id: i64,
        user_id: i64,
        text: &str,
        source_turn_id: Option<i64>,
        now_ts: i64,
    ) {
        if let Some(last) = self.last_run.get(&user_id) {
            if now_ts - *last < EXTRACT_THROTTLE_SECS {
                return;
            }
        }
        let extracted = extract_facts(text);
        if extracted.is_empty() {
            return;
        }
        self.last_run.insert(user_id, now_ts);

        for (category, key, value, confidence) in extracted {
            let evidence: String = text.chars().take(120).collect();
            match self.facts.add_fact(
                EntityType::User,
                user_id,
                &chat_id.to_string(),
                category,
                key,
                &value,
                confidence,
                Some(&evidence),
                source_turn_id,
            ) {
                Ok(id) => debug!(fact_id = id, user_id, key, "learned fact from message"),
                Err(e) => warn!(error = %e, user_id, "fact extraction write failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gryag_store::Storage;

    #[test]
    fn extracts_ukrainian_introduction() {
        let facts = extract_facts("Привіт, мене звати Тарас і я живу в Києві");
        let keys: Vec<&str> = facts.iter().map(|f| f.1).collect();
        assert!(keys.contains(&"name"));
        assert!(keys.contains(&"location"));
        let name = facts.iter().find(|f| f.1 == "name").unwrap();
        assert_eq!(name.2, "Тарас");
    }

    #[test]
    fn extracts_english_location() {
        let facts = extract_facts("btw I live in Lviv now");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].1, "location");
        assert_eq!(facts[0].2, "Lviv now");
    }

    #[test]
    fn plain_chatter_extracts_nothing() {
        assert!(extract_facts("коли реліз?").is_empty());
        assert!(extract_facts("lol ok").is_empty());
    }

    #[test]
    fn learner_is_throttled_per_user() {
        let repo = FactRepository::new(Storage::open_in_memory().unwrap());
        let learner = FactLearner::new(repo.clone());
        learner.learn_from(-100, 42, "мене звати Тарас", Some(1), 1000);
        // Second message inside the throttle window is ignored.
        learner.learn_from(-100, 42, "я живу в Одесі", Some(2), 1010);
        let facts = repo
            .get_facts(EntityType::User, 42, "-100", None, 0.0, 10)
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].source_turn_id, Some(1));
        // After the window it learns again.
        learner.learn_from(-100, 42, "я живу в Одесі", Some(3), 1100);
        let facts = repo
            .get_facts(EntityType::User, 42, "-100", None, 0.0, 10)
            .unwrap();
        assert_eq!(facts.len(), 2);
    }
}
