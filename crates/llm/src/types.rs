use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Message role (the subset every chat backend understands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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
}

/// One chat-completion call.
///
/// `label` names the call site (`scan/crowd/3`, `scan/adjudicate`,
/// `detailed/worker/src/lib.rs`); it is only used for logging and for routing in
/// [`crate::ScriptedClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub label: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub context_size: u32,
    pub timeout: Duration,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(label: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            label: label.into(),
            messages,
            max_tokens: 512,
            context_size: 8192,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            temperature: None,
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Text of the last user message, if any.
    pub fn user_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}
