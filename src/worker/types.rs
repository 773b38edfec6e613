use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Scope;

/// A request to analyze one session, or one iteration of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    #[serde(alias = "scope_id", alias = "sessionId")]
    pub session_id: String,
    #[serde(default, alias = "sub_scope")]
    pub iteration: Option<u32>,
}

impl AnalysisJob {
    pub fn new(session_id: impl Into<String>, iteration: Option<u32>) -> Self {
        Self {
            session_id: session_id.into(),
            iteration,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.session_id.clone(), self.iteration)
    }
}

/// A job on its way through the queue. `attempt` counts prior executions.
#[derive(Debug, Clone)]
pub(crate) struct JobEnvelope {
    pub job: AnalysisJob,
    pub attempt: u32,
}

/// A job the pool gave up on
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job: AnalysisJob,
    /// Executions that actually ran
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Point-in-time counters for a running pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub submitted: usize,
    pub completed: usize,
    /// Failed executions, including ones that were retried
    pub failed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub active: usize,
    /// Jobs accepted but not yet completed or dead-lettered
    pub pending: usize,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Every tracked task finished inside the grace period
    pub clean: bool,
    pub stats: PoolStats,
}

/// Work the pool runs for each job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &AnalysisJob) -> anyhow::Result<()>;
}
