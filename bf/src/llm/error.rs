//! LLM client error types

use std::time::Duration;

/// Errors surfaced by LLM clients
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no API key configured for {0}")]
    MissingApiKey(String),
}

impl LlmError {
    /// Whether a retry with backoff has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            LlmError::InvalidResponse(_) | LlmError::MissingApiKey(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            LlmError::ApiError {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::ApiError {
                status: 400,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            LlmError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(!LlmError::MissingApiKey("report".into()).is_retryable());
    }
}
