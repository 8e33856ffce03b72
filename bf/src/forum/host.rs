//! Forum moderator.
//!
//! Once enough agent statements accumulate, the moderator LLM reads the
//! buffered statements and produces one guiding remark. The call path is
//! non-critical: on failure the forum simply keeps recording.

use std::sync::Arc;

use tracing::{debug, info};

use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::retry::{RetryConfig, with_graceful_retry};

use super::parse::parse_forum_line;

const HOST_MAX_TOKENS: u32 = 1024;

const HOST_SYSTEM_PROMPT: &str = "你是一场舆情分析圆桌论坛的主持人。三位分析师（INSIGHT、MEDIA、QUERY）\
正在陆续发表对同一公共事件的阶段性观点。你的职责：概括他们最新发言的共识与分歧，指出值得深入的方向，\
并推动讨论继续。直接输出主持发言本身，不要任何前缀、署名或格式标记，控制在三句话以内。";

/// Moderator bound to one LLM client
pub struct HostSpeaker {
    client: Arc<dyn LlmClient>,
    retry: RetryConfig,
}

impl HostSpeaker {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            retry: RetryConfig::auxiliary(),
        }
    }

    #[cfg(test)]
    pub fn with_retry(client: Arc<dyn LlmClient>, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Generate one moderator remark from buffered forum lines.
    ///
    /// Lines that do not parse as agent statements are skipped. Returns
    /// None when nothing usable was buffered or the LLM stayed unreachable
    /// after retries.
    pub async fn generate_speech(&self, buffered_lines: &[String]) -> Option<String> {
        let statements: Vec<String> = buffered_lines
            .iter()
            .filter_map(|line| parse_forum_line(line))
            .filter(|entry| {
                matches!(
                    entry.source,
                    super::parse::ForumSource::Insight
                        | super::parse::ForumSource::Media
                        | super::parse::ForumSource::Query
                )
            })
            .map(|entry| {
                let content = entry.content.replace("\\n", "\n");
                format!("[{}] {}: {}", entry.timestamp, entry.source, content)
            })
            .collect();

        if statements.is_empty() {
            debug!("generate_speech: no agent statements in buffer");
            return None;
        }

        let user_prompt = format!("三位分析师的最新发言：\n\n{}", statements.join("\n"));
        let request = CompletionRequest {
            system_prompt: HOST_SYSTEM_PROMPT.to_string(),
            messages: vec![Message::user(user_prompt)],
            max_tokens: HOST_MAX_TOKENS,
        };

        let client = self.client.clone();
        let speech = with_graceful_retry(&self.retry, "forum host", None, move || {
            let client = client.clone();
            let request = request.clone();
            async move { client.complete(request).await.map(Some) }
        })
        .await?;

        let text = format_speech(speech.text());
        if text.is_empty() {
            return None;
        }
        info!(chars = text.chars().count(), "moderator speech generated");
        Some(text)
    }
}

/// Flatten the speech to one logical line and drop decoration the model
/// sometimes adds.
fn format_speech(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    for prefix in ["主持人：", "主持人:", "HOST:", "[HOST]"] {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim().to_string();
        }
    }
    text
}
