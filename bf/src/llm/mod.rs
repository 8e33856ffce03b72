//! LLM client module
//!
//! One OpenAI-compatible chat-completions client covers every provider the
//! engines use (Moonshot, DeepSeek, Gemini relays); they differ only in
//! base URL, key and model name.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

pub mod client;
mod error;
mod openai;
mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use openai::OpenAiClient;
pub use types::{CompletionRequest, CompletionResponse, Message, Role, StreamChunk, TokenUsage};

use crate::config::LlmCredentials;

/// Build a client from one role's credentials.
pub fn create_client(
    label: &str,
    creds: &LlmCredentials,
    timeout: Duration,
) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(label, base_url = %creds.base_url, model = %creds.model, "create_client");
    let api_key = creds
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| LlmError::MissingApiKey(label.to_string()))?;
    Ok(Arc::new(OpenAiClient::new(
        api_key,
        creds.base_url.clone(),
        creds.model.clone(),
        timeout,
    )?))
}
