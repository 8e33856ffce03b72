//! OpenAI-compatible chat-completions client.
//!
//! Covers every provider the platform talks to; they all speak the same
//! wire format behind different base URLs.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    CompletionRequest, CompletionResponse, LlmClient, LlmError, Role, StreamChunk, TokenUsage,
};

/// Maximum in-client retries for transient errors
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 1000;

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// OpenAI-compatible API client
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    http: Client,
}

impl OpenAiClient {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;
        Ok(Self {
            api_key,
            base_url,
            model,
            http,
        })
    }

    /// Providers disagree on whether the base URL already carries `/v1`.
    fn completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        debug!(model = %self.model, max_tokens = request.max_tokens, "build_request_body");
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        for message in &request.messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({
                "role": role,
                "content": message.content,
            }));
        }
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        })
    }

    fn parse_response(&self, api_response: ApiResponse) -> CompletionResponse {
        let content = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content);
        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        CompletionResponse { content, usage }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(model = %self.model, "complete: called");
        let url = self.completions_url();
        let body = self.build_request_body(&request);

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                warn!(attempt, backoff_ms = backoff, "complete: retrying after transient error");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let response = match self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    debug!(attempt, error = %e, "complete: network error");
                    last_error = Some(LlmError::Network(e));
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(60);
                return Err(LlmError::RateLimited {
                    retry_after: Duration::from_secs(retry_after),
                });
            }

            if is_retryable_status(status) && attempt < MAX_RETRIES {
                let text = response.text().await.unwrap_or_default();
                debug!(attempt, status, "complete: retryable status");
                last_error = Some(LlmError::ApiError { status, message: text });
                continue;
            }

            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(LlmError::ApiError { status, message: text });
            }

            let api_response: ApiResponse = response.json().await?;
            return Ok(self.parse_response(api_response));
        }

        Err(last_error.unwrap_or_else(|| LlmError::InvalidResponse("max retries exceeded".to_string())))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError> {
        debug!(model = %self.model, "stream: called");
        let url = self.completions_url();
        let mut body = self.build_request_body(&request);
        body["stream"] = serde_json::json!(true);

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(LlmError::Network)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, message: text });
        }

        let mut stream = response.bytes_stream();
        let mut full_content = String::new();
        let mut usage = TokenUsage::default();
        let mut buffer = String::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(LlmError::Network)?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE lines
            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }

                if let Some(data) = line.strip_prefix("data: ")
                    && let Ok(chunk_data) = serde_json::from_str::<ApiStreamChunk>(data)
                {
                    if let Some(choice) = chunk_data.choices.first()
                        && let Some(content) = &choice.delta.content
                        && !content.is_empty()
                    {
                        full_content.push_str(content);
                        let _ = chunk_tx.send(StreamChunk::TextDelta(content.clone())).await;
                    }
                    if let Some(u) = chunk_data.usage {
                        usage.input_tokens = u.prompt_tokens;
                        usage.output_tokens = u.completion_tokens;
                    }
                }
            }
        }

        let _ = chunk_tx.send(StreamChunk::Done { usage: usage.clone() }).await;

        Ok(CompletionResponse {
            content: if full_content.is_empty() { None } else { Some(full_content) },
            usage,
        })
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    choices: Vec<ApiStreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    delta: ApiDelta,
}

#[derive(Debug, Deserialize)]
struct ApiDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    fn client(base_url: &str) -> OpenAiClient {
        OpenAiClient::new(
            "sk-test".to_string(),
            base_url.to_string(),
            "test-model".to_string(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_url_with_v1_suffix() {
        assert_eq!(
            client("https://api.moonshot.cn/v1").completions_url(),
            "https://api.moonshot.cn/v1/chat/completions"
        );
    }

    #[test]
    fn test_url_without_v1_suffix() {
        assert_eq!(
            client("https://api.deepseek.com").completions_url(),
            "https://api.deepseek.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_url_trailing_slash() {
        assert_eq!(
            client("https://aihubmix.com/v1/").completions_url(),
            "https://aihubmix.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_request_body_shape() {
        let c = client("https://api.deepseek.com");
        let body = c.build_request_body(&CompletionRequest {
            system_prompt: "you are a host".to_string(),
            messages: vec![Message::user("summarize")],
            max_tokens: 2048,
        });
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "summarize");
    }

    #[test]
    fn test_parse_response_extracts_content_and_usage() {
        let c = client("https://api.deepseek.com");
        let api: ApiResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "hello"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}}"#,
        )
        .unwrap();
        let response = c.parse_response(api);
        assert_eq!(response.text(), "hello");
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 3);
    }

    #[test]
    fn test_parse_response_empty_choices() {
        let c = client("https://api.deepseek.com");
        let api: ApiResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        let response = c.parse_response(api);
        assert!(response.content.is_none());
    }

    #[test]
    fn test_stream_chunk_deserializes() {
        let chunk: ApiStreamChunk =
            serde_json::from_str(r#"{"choices": [{"delta": {"content": "to"}}]}"#).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("to"));
    }
}
