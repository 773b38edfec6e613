pub mod client;
pub mod cluster;
pub mod prompt;
pub mod types;


pub use client::{ChatClient, Generator, SummarizerError};
pub use cluster::ClusterSummarizer;
pub use types::{ChatMessage, ClusterSummary, CompletionOptions, HealthResponse, Role, SummaryOutcome};

pub const DEFAULT_CHAT_MODEL: &str = "qwen2.5-14b-instruct";

/// Label used when a cluster holds one question
pub const SINGLE_QUESTION_SUMMARY: &str = "Single question";

pub const MULTIPLE_QUESTIONS_SUMMARY: &str = "Multiple similar questions";

/// Characters of a non-JSON reply kept as the summary
pub const FALLBACK_SUMMARY_CHARS: usize = 200;
