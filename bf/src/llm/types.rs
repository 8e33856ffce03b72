//! Request/response types for LLM completions

use serde::{Deserialize, Serialize};

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A single completion request. Every call is independent: the pipeline
/// carries its own context in the prompt, no conversation state lives in
/// the client.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

/// Token accounting from the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Completed response
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// The text content, empty string when the provider returned none.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Streaming events forwarded while a completion is in flight
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Incremental text
    TextDelta(String),
    /// Stream finished
    Done { usage: TokenUsage },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let user = Message::user("hello");
        assert_eq!(user.role, Role::User);
        let assistant = Message::assistant("hi");
        assert_eq!(assistant.role, Role::Assistant);
    }

    #[test]
    fn test_response_text_fallback() {
        let response = CompletionResponse {
            content: None,
            usage: TokenUsage::default(),
        };
        assert_eq!(response.text(), "");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }
}
