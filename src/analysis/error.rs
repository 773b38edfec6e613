use thiserror::Error;

use super::stage::JobStage;
use crate::clusterer::SimilarityError;
use crate::model::Scope;

/// Failures that abort a whole analysis job. Per-question and per-cluster
/// problems never surface here.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Failed to load questions for {scope}: {cause:#}")]
    Load { scope: Scope, cause: anyhow::Error },

    #[error("Failed to update session {session_id} while {stage}: {cause:#}")]
    Status {
        session_id: String,
        stage: JobStage,
        cause: anyhow::Error,
    },

    #[error("Failed to persist clusters for {scope}: {cause:#}")]
    Persistence { scope: Scope, cause: anyhow::Error },

    #[error("Clustering failed for {scope}: {source}")]
    Similarity {
        scope: Scope,
        #[source]
        source: SimilarityError,
    },
}

impl AnalysisError {
    /// Stage the job was in when it failed
    pub fn stage(&self) -> JobStage {
        match self {
            AnalysisError::Load { .. } => JobStage::Received,
            AnalysisError::Status { stage, .. } => *stage,
            AnalysisError::Persistence { .. } => JobStage::Persisting,
            AnalysisError::Similarity { .. } => JobStage::Clustering,
        }
    }
}
