use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Process-local identity, stable across in-place content updates.
    #[serde(skip, default = "Uuid::new_v4")]
    pub local_id: Uuid,
    /// Server id; `None` for optimistic messages.
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tokens: i64,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            id: None,
            conversation_id: None,
            role,
            content: content.into(),
            tokens: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Which conversation a generation writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationRef {
    /// Not yet created on the server; the first exchange creates it.
    Pending,
    Persisted(i64),
}

impl ConversationRef {
    pub fn id(&self) -> Option<i64> {
        match self {
            Self::Pending => None,
            Self::Persisted(id) => Some(*id),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationList {
    pub total: i64,
    pub conversations: Vec<Conversation>,
}

/// Partial update for a conversation; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ConversationPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            model: None,
        }
    }

    pub fn apply_to(&self, conversation: &mut Conversation) {
        if let Some(title) = &self.title {
            conversation.title = title.clone();
        }
        if let Some(model) = &self.model {
            conversation.model = model.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "TokenPair::default_token_type")]
    pub token_type: String,
}

impl TokenPair {
    fn default_token_type() -> String {
        "bearer".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default = "User::default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    fn default_active() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub provider: &'static str,
    pub description: &'static str,
}

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

pub const AVAILABLE_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gpt-3.5-turbo",
        name: "GPT-3.5 Turbo",
        provider: "OpenAI",
        description: "Fast and inexpensive, suited to most conversations",
    },
    ModelInfo {
        id: "gpt-4",
        name: "GPT-4",
        provider: "OpenAI",
        description: "Stronger reasoning for complex tasks",
    },
    ModelInfo {
        id: "gpt-4-turbo",
        name: "GPT-4 Turbo",
        provider: "OpenAI",
        description: "Optimised GPT-4 with better cost/performance",
    },
    ModelInfo {
        id: "claude-3-opus",
        name: "Claude 3 Opus",
        provider: "Anthropic",
        description: "Most capable Claude 3 model for complex tasks",
    },
    ModelInfo {
        id: "claude-3-sonnet",
        name: "Claude 3 Sonnet",
        provider: "Anthropic",
        description: "Balanced performance and cost",
    },
    ModelInfo {
        id: "claude-3-haiku",
        name: "Claude 3 Haiku",
        provider: "Anthropic",
        description: "Fast and inexpensive",
    },
];

pub fn find_model(id: &str) -> Option<&'static ModelInfo> {
    AVAILABLE_MODELS.iter().find(|model| model.id == id)
}
