// model.rs - rows the analysis pipeline reads and writes
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-length embedding owned by the question that holds it
pub type Embedding = Vec<f32>;

/// One audience submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub session_id: String,
    pub text: String,
    pub embedding: Option<Embedding>,
    pub cluster_id: Option<String>,
    /// Collection round within the session (1-based)
    pub iteration: u32,
    pub submitted_at: DateTime<Utc>,
}

impl Question {
    /// A stored embedding counts only when it is non-empty
    pub fn usable_embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref().filter(|v| !v.is_empty())
    }
}

/// A persisted group of similar questions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionCluster {
    pub id: String,
    pub session_id: String,
    pub iteration: u32,
    pub label: Option<String>,
    pub representative_question: String,
    pub question_count: u32,
    pub centroid: Option<Embedding>,
    pub created_at: DateTime<Utc>,
}

/// The set of questions one analysis job covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub session_id: String,
    pub iteration: Option<u32>,
}

impl Scope {
    /// Iterations are 1-based, so `Some(0)` means the whole session
    pub fn new(session_id: impl Into<String>, iteration: Option<u32>) -> Self {
        Self {
            session_id: session_id.into(),
            iteration: iteration.filter(|&it| it > 0),
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            iteration: None,
        }
    }

    pub fn iteration(session_id: impl Into<String>, iteration: u32) -> Self {
        Self {
            session_id: session_id.into(),
            iteration: Some(iteration),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iteration {
            Some(it) => write!(f, "{}#{}", self.session_id, it),
            None => write!(f, "{}", self.session_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Paused,
    Completed,
    Analyzing,
    Analyzed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Analyzing => "analyzing",
            SessionStatus::Analyzed => "analyzed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(SessionStatus::Waiting),
            "active" => Some(SessionStatus::Active),
            "paused" => Some(SessionStatus::Paused),
            "completed" => Some(SessionStatus::Completed),
            "analyzing" => Some(SessionStatus::Analyzing),
            "analyzed" => Some(SessionStatus::Analyzed),
            _ => None,
        }
    }
}
