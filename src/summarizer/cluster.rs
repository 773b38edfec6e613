use std::sync::Arc;
use tracing::warn;

use super::client::Generator;
use super::prompt::{cluster_messages, parse_summary, truncate_chars};
use super::types::{ClusterSummary, CompletionOptions, SummaryOutcome};
use super::{FALLBACK_SUMMARY_CHARS, MULTIPLE_QUESTIONS_SUMMARY, SINGLE_QUESTION_SUMMARY};

/// Labels a group of questions. Never fails: a bad or missing model reply
/// degrades the label instead.
#[derive(Clone)]
pub struct ClusterSummarizer {
    generator: Arc<dyn Generator>,
    options: CompletionOptions,
}

impl ClusterSummarizer {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            options: CompletionOptions {
                temperature: 0.3,
                max_tokens: 512,
                ..CompletionOptions::default()
            },
        }
    }

    pub async fn summarize(&self, questions: &[String]) -> ClusterSummary {
        if questions.len() <= 1 {
            return ClusterSummary {
                representative: questions.first().cloned().unwrap_or_default(),
                summary: SINGLE_QUESTION_SUMMARY.to_string(),
                outcome: SummaryOutcome::SingleItem,
            };
        }

        let first = questions[0].clone();
        let messages = cluster_messages(questions);

        let raw = match self.generator.complete(&messages, self.options).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(questions = questions.len(), error = %e, "cluster summarization failed");
                return ClusterSummary {
                    representative: first,
                    summary: format!("{} similar questions", questions.len()),
                    outcome: SummaryOutcome::Unavailable(e.to_string()),
                };
            }
        };

        match parse_summary(&raw) {
            Some(payload) => ClusterSummary {
                representative: non_empty(payload.representative).unwrap_or(first),
                summary: non_empty(payload.summary)
                    .unwrap_or_else(|| MULTIPLE_QUESTIONS_SUMMARY.to_string()),
                outcome: SummaryOutcome::Generated,
            },
            None => {
                warn!(questions = questions.len(), "summary reply was not JSON, using raw text");
                let trimmed = raw.trim();
                let summary = if trimmed.is_empty() {
                    MULTIPLE_QUESTIONS_SUMMARY.to_string()
                } else {
                    truncate_chars(trimmed, FALLBACK_SUMMARY_CHARS)
                };
                ClusterSummary {
                    representative: first,
                    summary,
                    outcome: SummaryOutcome::Unparseable,
                }
            }
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
