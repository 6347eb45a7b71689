//! Request and response shapes shared by the orchestrators and the HTTP layer.
//!
//! None of these are persisted; they describe what flows between the caller,
//! this service, and the external Azure services.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Wire form used in outbound chat completion requests.
    pub fn to_value(&self) -> Value {
        json!({ "role": self.role.as_str(), "content": self.content })
    }
}

/// A document returned by the search index.
///
/// The field set is owned by the index schema; only a few well-known text
/// fields are ever inspected (see [`crate::retrieval::document_text`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetrievedDocument(pub Map<String, Value>);

impl RetrievedDocument {
    /// Wrap a JSON value, returning `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }
}

/// Storage key assigned to an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub name: String,
}

/// One entry of a blob listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobInfo {
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    /// RFC 3339 timestamp.
    pub last_modified: Option<String>,
}

/// Run status as reported by the agent service.
///
/// The state machine belongs to the service; unknown values are carried
/// through unchanged and treated as terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
    Other(String),
}

impl AgentRunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            "requires_action" => Self::RequiresAction,
            "cancelling" => Self::Cancelling,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            "completed" => Self::Completed,
            "expired" => Self::Expired,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Other(s) => s,
        }
    }

    /// Whether the run is still waiting to finish.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }
}

impl Serialize for AgentRunStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Observed state of an agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRun {
    pub id: String,
    pub status: AgentRunStatus,
    pub last_error: Option<Value>,
}

/// A message read back from an agent thread.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

impl ThreadMessage {
    /// First text part of the message, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|part| match part {
            ContentPart::Text { text } => Some(text.value.as_str()),
            ContentPart::Other => None,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: TextValue },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextValue {
    pub value: String,
}

/// One line of an agent transcript returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub text: String,
}
