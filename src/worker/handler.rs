use async_trait::async_trait;
use tracing::debug;

use super::types::{AnalysisJob, JobHandler};
use crate::analysis::Analyzer;

#[async_trait]
impl JobHandler for Analyzer {
    async fn handle(&self, job: &AnalysisJob) -> anyhow::Result<()> {
        let report = self.run(&job.scope()).await?;
        debug!(
            session_id = %job.session_id,
            clusters = report.clusters.len(),
            degraded = report.degraded_summaries,
            "job handled"
        );
        Ok(())
    }
}
