use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Model => "model",
            Self::System => "system",
            Self::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "model" => Ok(Self::Model),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
    FileUri,
}

/// Payload of a media part: inline base64 bytes or a provider file reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaData {
    Base64(String),
    FileUri(String),
}

/// One ordered media attachment on a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPart {
    pub kind: MediaKind,
    pub mime: String,
    pub data: MediaData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl MediaPart {
    pub fn inline(kind: MediaKind, mime: impl Into<String>, b64: impl Into<String>) -> Self {
        Self {
            kind,
            mime: mime.into(),
            data: MediaData::Base64(b64.into()),
            size: None,
        }
    }

    pub fn file_uri(mime: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::FileUri,
            mime: mime.into(),
            data: MediaData::FileUri(uri.into()),
            size: None,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video || self.mime.starts_with("video/")
    }
}

/// One stored chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub message_id: Option<i64>,
    pub user_id: i64,
    pub role: Role,
    pub text: String,
    pub media: Vec<MediaPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub importance: Option<f64>,
    pub ts: i64,
    pub retention_days: i64,
}

/// Insert payload for [`crate::ContextStore::add_turn`].
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub message_id: Option<i64>,
    pub user_id: i64,
    pub role: Role,
    pub text: String,
    pub media: Vec<MediaPart>,
    pub embedding: Option<Vec<f32>>,
    pub ts: i64,
    pub retention_days: i64,
}

impl NewTurn {
    pub fn text_only(chat_id: i64, user_id: i64, role: Role, text: impl Into<String>, ts: i64) -> Self {
        Self {
            chat_id,
            thread_id: None,
            message_id: None,
            user_id,
            role,
            text: text.into(),
            media: Vec::new(),
            embedding: None,
            ts,
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionalValence {
    Positive,
    Negative,
    Mixed,
    Neutral,
}

impl std::fmt::Display for EmotionalValence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Mixed => "mixed",
            Self::Neutral => "neutral",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EmotionalValence {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "mixed" => Ok(Self::Mixed),
            "neutral" => Ok(Self::Neutral),
            other => Err(format!("unknown valence: {other}")),
        }
    }
}

/// A sealed, summarised span of conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Episode {
    pub id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub start_turn_id: i64,
    pub end_turn_id: i64,
    pub participants: Vec<i64>,
    pub summary: String,
    pub topic: String,
    pub tags: Vec<String>,
    pub importance: f64,
    pub emotional_valence: EmotionalValence,
    pub created_at: i64,
}

/// Summary payload produced when an episode seals.
#[derive(Debug, Clone)]
pub struct EpisodeSummary {
    pub summary: String,
    pub topic: String,
    pub tags: Vec<String>,
    pub importance: f64,
    pub emotional_valence: EmotionalValence,
}
