//! LlmClient trait definition

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionRequest, CompletionResponse, LlmError, StreamChunk};

/// Stateless LLM client - each call is independent.
///
/// The pipeline assembles the full context for every call; no conversation
/// state is maintained between requests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a completion request and wait for the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streaming completion. Chunks go to `chunk_tx` as they arrive; the
    /// final complete response is returned.
    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::llm::TokenUsage;

    /// Scripted outcome for one mock call
    pub enum MockOutcome {
        Text(String),
        Error(LlmError),
    }

    impl MockOutcome {
        pub fn text(s: impl Into<String>) -> Self {
            Self::Text(s.into())
        }

        pub fn api_error(status: u16, message: impl Into<String>) -> Self {
            Self::Error(LlmError::ApiError {
                status,
                message: message.into(),
            })
        }
    }

    /// Mock LLM client for unit tests: returns scripted outcomes in order.
    pub struct MockLlmClient {
        outcomes: Mutex<VecDeque<MockOutcome>>,
        call_count: AtomicUsize,
    }

    impl MockLlmClient {
        pub fn new(outcomes: Vec<MockOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                call_count: AtomicUsize::new(0),
            }
        }

        /// Convenience: every call returns the same text.
        pub fn repeating(text: impl Into<String>) -> Self {
            let text = text.into();
            Self {
                outcomes: Mutex::new(
                    std::iter::repeat_with(|| MockOutcome::Text(text.clone()))
                        .take(64)
                        .collect(),
                ),
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<CompletionResponse, LlmError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.lock().expect("mock lock").pop_front() {
                Some(MockOutcome::Text(text)) => Ok(CompletionResponse {
                    content: Some(text),
                    usage: TokenUsage::default(),
                }),
                Some(MockOutcome::Error(e)) => Err(e),
                None => Err(LlmError::InvalidResponse("no more mock responses".to_string())),
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.next()
        }

        async fn stream(
            &self,
            _request: CompletionRequest,
            chunk_tx: mpsc::Sender<StreamChunk>,
        ) -> Result<CompletionResponse, LlmError> {
            let response = self.next()?;
            // Stream the canned text in two halves so callers exercise
            // their delta handling.
            if let Some(text) = &response.content {
                let mid = text.len() / 2;
                let mid = (0..=mid).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
                let (a, b) = text.split_at(mid);
                for part in [a, b] {
                    if !part.is_empty() {
                        let _ = chunk_tx.send(StreamChunk::TextDelta(part.to_string())).await;
                    }
                }
            }
            let _ = chunk_tx
                .send(StreamChunk::Done {
                    usage: response.usage.clone(),
                })
                .await;
            Ok(response)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_returns_outcomes_in_order() {
            let client = MockLlmClient::new(vec![
                MockOutcome::text("first"),
                MockOutcome::api_error(500, "boom"),
            ]);
            let request = CompletionRequest {
                system_prompt: "s".into(),
                messages: vec![],
                max_tokens: 10,
            };

            let first = client.complete(request.clone()).await.unwrap();
            assert_eq!(first.text(), "first");

            let second = client.complete(request).await;
            assert!(matches!(second, Err(LlmError::ApiError { status: 500, .. })));
            assert_eq!(client.call_count(), 2);
        }

        #[tokio::test]
        async fn test_mock_streams_deltas() {
            let client = MockLlmClient::new(vec![MockOutcome::text("hello world")]);
            let (tx, mut rx) = mpsc::channel(16);
            let request = CompletionRequest {
                system_prompt: "s".into(),
                messages: vec![],
                max_tokens: 10,
            };

            let response = client.stream(request, tx).await.unwrap();
            assert_eq!(response.text(), "hello world");

            let mut collected = String::new();
            while let Some(chunk) = rx.recv().await {
                if let StreamChunk::TextDelta(delta) = chunk {
                    collected.push_str(&delta);
                }
            }
            assert_eq!(collected, "hello world");
        }

        #[tokio::test]
        async fn test_mock_errors_when_exhausted() {
            let client = MockLlmClient::new(vec![]);
            let request = CompletionRequest {
                system_prompt: "s".into(),
                messages: vec![],
                max_tokens: 10,
            };
            assert!(client.complete(request).await.is_err());
        }
    }
}
