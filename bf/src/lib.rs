//! BettaFish - orchestration and streaming fabric for multi-agent public
//! opinion analysis
//!
//! One supervisor process coordinates three analysis engines, a forum
//! aggregator that turns their logs into a moderated discussion record,
//! and a staged LLM pipeline that compiles everything into a validated
//! report document.
//!
//! # Modules
//!
//! - [`config`] - layered `.env` settings with explicit reload
//! - [`jsonrepair`] - tolerant JSON parsing for LLM output
//! - [`llm`] - OpenAI-compatible completion clients
//! - [`retry`] - exponential backoff helpers (fatal and graceful)
//! - [`events`] - per-task event history and fan-out
//! - [`forum`] - engine log tailing and the moderator loop
//! - [`report`] - the staged report pipeline, validator and composer
//! - [`supervisor`] - child process lifecycle and shutdown choreography
//! - [`http`] - REST + SSE surface

pub mod cli;
pub mod config;
pub mod events;
pub mod forum;
pub mod http;
pub mod jsonrepair;
pub mod llm;
pub mod report;
pub mod retry;
pub mod supervisor;

// Re-export commonly used types
pub use config::{ConfigError, LlmCredentials, Settings};
pub use events::{Event, EventBus, EventKind};
pub use forum::{ForumAggregator, ForumConfig, ForumEntry, ForumSource, HostSpeaker};
pub use http::{AppState, ReportTask, TaskRegistry, TaskStatus};
pub use jsonrepair::{ParseError, RobustJsonParser};
pub use llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, OpenAiClient};
pub use report::{
    ChapterErrorKind, DocumentComposer, IrValidator, PipelineError, ReportPipeline,
    TemplateSection, parse_template_sections,
};
pub use retry::{RetryConfig, with_graceful_retry, with_retry, with_retry_if};
pub use supervisor::{Supervisor, SupervisorError};
