//! Forum aggregator
//!
//! Tails the three engine log files, extracts structured agent statements
//! from their summary-node output, writes the canonical `forum.log`, and
//! invites an LLM moderator to speak once enough material has accumulated.

mod aggregator;
mod host;
mod parse;

pub use aggregator::{ForumAggregator, ForumConfig, ForumHandle, start_forum};
pub use host::HostSpeaker;
pub use parse::{ForumEntry, ForumSource, parse_forum_line, strip_timestamp};
