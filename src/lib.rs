// Public API exports
pub mod analysis;
pub mod clusterer;
pub mod config;
pub mod db;
pub mod embedder;
pub mod model;
pub mod summarizer;
pub mod telemetry;
pub mod worker;

// Re-export main types for convenience
pub use model::{Embedding, Question, QuestionCluster, Scope, SessionStatus};

pub use db::{NewCluster, QuestionStore, SqliteStore};

pub use embedder::{Batcher, EmbedError, Embedder, EmbeddingClient};

pub use clusterer::{
    agglomerate, cosine_similarity, most_representative, Cluster, ClusterParams, ClusterResult,
    SimilarityError,
};

pub use summarizer::{ChatClient, ClusterSummarizer, ClusterSummary, Generator, SummaryOutcome};

pub use analysis::{AnalysisError, AnalysisOutcome, AnalysisReport, AnalysisSettings, Analyzer, JobStage};

pub use worker::{AnalysisJob, DeadLetter, JobHandler, PoolConfig, PoolStats, RetryPolicy, WorkerPool};

pub use config::{Config, ConfigError};
