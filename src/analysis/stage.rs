use std::fmt;

/// Where a job is in its run. `Failed` can follow any other stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    Received,
    Embedding,
    Clustering,
    Summarizing,
    Persisting,
    Done,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Received => "received",
            JobStage::Embedding => "embedding",
            JobStage::Clustering => "clustering",
            JobStage::Summarizing => "summarizing",
            JobStage::Persisting => "persisting",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        }
    }

    /// Stage that follows on success; terminal stages have none
    pub fn next(&self) -> Option<JobStage> {
        match self {
            JobStage::Received => Some(JobStage::Embedding),
            JobStage::Embedding => Some(JobStage::Clustering),
            JobStage::Clustering => Some(JobStage::Summarizing),
            JobStage::Summarizing => Some(JobStage::Persisting),
            JobStage::Persisting => Some(JobStage::Done),
            JobStage::Done | JobStage::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
