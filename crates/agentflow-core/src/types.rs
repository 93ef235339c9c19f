use std::fmt;

use serde::{Deserialize, Serialize};

/// Conversation role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
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

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chat message. Order within a history is replayed verbatim to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A uniform request sent to any provider.
///
/// `temperature` and `max_output_tokens` use `0` for "backend default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub streaming: bool,
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
    /// Any backend-specific reason we do not model (e.g. "tool_calls", "load").
    #[serde(untagged)]
    Other(String),
}

impl FinishReason {
    /// Map a raw wire value. Empty strings map to `Other("")`.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "error" => FinishReason::Error,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Error => "error",
            FinishReason::Other(s) => s,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The normalized result of a non-streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub finish_reason: FinishReason,
    /// Backend-reported token count. Ollama: prompt eval + eval counts.
    /// OpenAI-compatible: `usage.total_tokens`.
    pub tokens_used: u64,
}

/// One increment of a streamed response.
///
/// A chunk with `error` set is the last chunk a producer sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
            error: None,
        }
    }

    pub fn finished(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: true,
            error: None,
        }
    }

    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            content: String::new(),
            done: false,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True for chunks after which the producer sends nothing more.
    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}
