// config.rs - deployment settings, read from flags or the environment
use clap::Args;
use std::time::Duration;
use thiserror::Error;

use crate::analysis::AnalysisSettings;
use crate::clusterer::ClusterParams;
use crate::worker::{PoolConfig, RetryPolicy};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Similarity threshold must be within [-1, 1], got {0}")]
    ThresholdOutOfRange(f32),

    #[error("{name} must be at least 1")]
    Zero { name: &'static str },
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// SQLite database holding sessions, questions and clusters
    #[arg(long = "database", env = "DATABASE_PATH", default_value = "qcluster.db")]
    pub database_path: String,

    /// Open SQLite connections shared by the workers
    #[arg(long, env = "DATABASE_POOL_SIZE", default_value_t = crate::db::DEFAULT_POOL_SIZE)]
    pub db_pool_size: u32,

    /// Merge groups only when their similarity is strictly above this
    #[arg(long, env = "CLUSTERING_THRESHOLD", default_value_t = 0.85, allow_negative_numbers = true)]
    pub similarity_threshold: f32,

    #[arg(long, env = "MIN_CLUSTER_SIZE", default_value_t = 2)]
    pub min_cluster_size: usize,

    /// Expected embedding length; vectors of any other length are ignored
    #[arg(long, env = "EMBEDDING_DIM")]
    pub embedding_dim: Option<usize>,

    /// Embedding endpoint base URL (defaults to the LLM URL)
    #[arg(long, env = "EMBEDDING_SERVICE_URL")]
    pub embedding_url: Option<String>,

    #[arg(long, env = "EMBEDDING_SERVICE_API_KEY", hide_env_values = true)]
    pub embedding_api_key: Option<String>,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = crate::embedder::DEFAULT_EMBEDDING_MODEL)]
    pub embedding_model: String,

    #[arg(long, env = "EMBEDDING_TIMEOUT", default_value_t = 15_000)]
    pub embedding_timeout_ms: u64,

    /// Embedding requests in flight at once
    #[arg(long, env = "EMBEDDING_WAVE_SIZE", default_value_t = crate::embedder::DEFAULT_WAVE_SIZE)]
    pub embedding_wave: usize,

    /// OpenAI-compatible chat endpoint base URL
    #[arg(long, env = "EXTERNAL_LLM_URL", default_value = "http://localhost:8080/v1")]
    pub llm_url: String,

    #[arg(long, env = "EXTERNAL_LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    #[arg(long, env = "CHAT_MODEL", default_value = crate::summarizer::DEFAULT_CHAT_MODEL)]
    pub chat_model: String,

    #[arg(long, env = "LLM_TIMEOUT", default_value_t = 60_000)]
    pub llm_timeout_ms: u64,

    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 4)]
    pub worker_concurrency: usize,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "RETRY_BASE_MS", default_value_t = 1000)]
    pub retry_base_ms: u64,

    /// How long shutdown waits for running jobs
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.similarity_threshold));
        }
        for (name, value) in [
            ("min cluster size", self.min_cluster_size),
            ("embedding wave size", self.embedding_wave),
            ("worker concurrency", self.worker_concurrency),
            ("database pool size", self.db_pool_size as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        Ok(())
    }

    pub fn embedding_url(&self) -> &str {
        self.embedding_url.as_deref().unwrap_or(&self.llm_url)
    }

    pub fn embedding_api_key(&self) -> Option<&str> {
        self.embedding_api_key
            .as_deref()
            .or(self.llm_api_key.as_deref())
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            params: ClusterParams {
                threshold: self.similarity_threshold,
                min_size: self.min_cluster_size,
            },
            expected_dim: self.embedding_dim,
            embedding_wave: self.embedding_wave,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            concurrency: self.worker_concurrency,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_ms),
            },
        }
    }
}
