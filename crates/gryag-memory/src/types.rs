use serde::{Deserialize, Serialize};

/// Sentinel chat context for facts that apply everywhere.
pub const GLOBAL_CONTEXT: &str = "global";

/// Which kind of entity a fact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    User,
    Chat,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "chat" => Ok(Self::Chat),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Fact category. User entities use the personal range; chat entities the
/// communal range. Stored as lowercase snake_case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    Personal,
    Preference,
    Skill,
    Trait,
    Opinion,
    Relationship,
    Rule,
    Culture,
    Tradition,
    Norm,
    Topic,
    Event,
    SharedKnowledge,
}

impl FactCategory {
    pub const ALL: [FactCategory; 13] = [
        Self::Personal,
        Self::Preference,
        Self::Skill,
        Self::Trait,
        Self::Opinion,
        Self::Relationship,
        Self::Rule,
        Self::Culture,
        Self::Tradition,
        Self::Norm,
        Self::Topic,
        Self::Event,
        Self::SharedKnowledge,
    ];
}

impl std::fmt::Display for FactCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Personal => "personal",
            Self::Preference => "preference",
            Self::Skill => "skill",
            Self::Trait => "trait",
            Self::Opinion => "opinion",
            Self::Relationship => "relationship",
            Self::Rule => "rule",
            Self::Culture => "culture",
            Self::Tradition => "tradition",
            Self::Norm => "norm",
            Self::Topic => "topic",
            Self::Event => "event",
            Self::SharedKnowledge => "shared_knowledge",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for FactCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(Self::Personal),
            "preference" => Ok(Self::Preference),
            "skill" => Ok(Self::Skill),
            "trait" => Ok(Self::Trait),
            "opinion" => Ok(Self::Opinion),
            "relationship" => Ok(Self::Relationship),
            "rule" => Ok(Self::Rule),
            "culture" => Ok(Self::Culture),
            "tradition" => Ok(Self::Tradition),
            "norm" => Ok(Self::Norm),
            "topic" => Ok(Self::Topic),
            "event" => Ok(Self::Event),
            "shared_knowledge" => Ok(Self::SharedKnowledge),
            other => Err(format!("unknown fact category: {other}")),
        }
    }
}

/// Why a fact row changed. One version record per change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Creation,
    Reinforcement,
    Evolution,
    Correction,
    Deletion,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creation => "creation",
            Self::Reinforcement => "reinforcement",
            Self::Evolution => "evolution",
            Self::Correction => "correction",
            Self::Deletion => "deletion",
        };
        write!(f, "{s}")
    }
}

/// Caller-supplied reason for a soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgetReason {
    Outdated,
    Incorrect,
    Superseded,
    UserRequested,
}

impl std::fmt::Display for ForgetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Outdated => "outdated",
            Self::Incorrect => "incorrect",
            Self::Superseded => "superseded",
            Self::UserRequested => "user_requested",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ForgetReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outdated" => Ok(Self::Outdated),
            "incorrect" => Ok(Self::Incorrect),
            "superseded" => Ok(Self::Superseded),
            "user_requested" => Ok(Self::UserRequested),
            other => Err(format!("unknown forget reason: {other}")),
        }
    }
}

/// Outcome of `forget_fact` — forgetting an absent id is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgetStatus {
    Success,
    NotFound,
}

/// A discrete knowledge triple with confidence and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub chat_context: String,
    pub category: FactCategory,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub evidence: Option<String>,
    /// Turn the fact was learned from; protects that turn from retention
    /// pruning while the fact stays active.
    pub source_turn_id: Option<i64>,
    pub is_active: bool,
    pub evidence_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
    pub updated_at: i64,
    /// True when the row was surfaced from the read-only legacy table.
    #[serde(default)]
    pub legacy: bool,
}

/// One entry in a fact's change history.
#[derive(Debug, Clone, Serialize)]
pub struct FactVersion {
    pub id: i64,
    pub fact_id: i64,
    pub change_type: ChangeType,
    pub value: Option<String>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
    pub created_at: i64,
}

/// Derived per-chat user projection.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub user_id: i64,
    pub chat_id: i64,
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub pronouns: Option<String>,
    pub membership: String,
    pub interaction_count: i64,
    pub last_seen: i64,
    pub summary: Option<String>,
}

/// Scope of a system-prompt override. Resolution order: chat > global > default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptScope {
    Global,
    Chat,
    Personal,
}

impl std::fmt::Display for PromptScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Global => "global",
            Self::Chat => "chat",
            Self::Personal => "personal",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PromptScope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "chat" => Ok(Self::Chat),
            "personal" => Ok(Self::Personal),
            other => Err(format!("unknown prompt scope: {other}")),
        }
    }
}

/// A stored system-prompt override version.
#[derive(Debug, Clone, Serialize)]
pub struct PromptOverride {
    pub id: i64,
    pub scope: PromptScope,
    pub chat_id: Option<i64>,
    pub admin_id: i64,
    pub version: i64,
    pub prompt_text: String,
    pub is_active: bool,
    pub created_at: i64,
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn category_round_trips_through_text() {
        for cat in FactCategory::ALL {
            let s = cat.to_string();
            assert_eq!(FactCategory::from_str(&s).unwrap(), cat);
        }
    }

    #[test]
    fn shared_knowledge_is_snake_case() {
        assert_eq!(FactCategory::SharedKnowledge.to_string(), "shared_knowledge");
    }

    #[test]
    fn forget_reason_parses() {
        assert_eq!(
            ForgetReason::from_str("user_requested").unwrap(),
            ForgetReason::UserRequested
        );
        assert!(ForgetReason::from_str("because").is_err());
    }

    #[test]
    fn entity_type_round_trips() {
        assert_eq!(EntityType::from_str("chat").unwrap(), EntityType::Chat);
        assert_eq!(EntityType::User.to_string(), "user");
    }
}
