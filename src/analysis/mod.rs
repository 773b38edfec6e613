mod error;
mod orchestrator;
mod stage;

#[cfg(test)]
mod tests;

pub use error::AnalysisError;
pub use orchestrator::{AnalysisOutcome, AnalysisReport, AnalysisSettings, Analyzer};
pub use stage::JobStage;
