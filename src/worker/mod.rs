mod handler;
mod pool;
mod retry;
mod types;


pub use pool::{PoolConfig, PoolError, WorkerPool};
pub use retry::{RetryDecision, RetryPolicy};
pub use types::{AnalysisJob, DeadLetter, JobHandler, PoolStats, ShutdownReport};
