pub mod batcher;
pub mod client;
pub mod types;


pub use batcher::Batcher;
pub use client::{EmbedError, Embedder, EmbeddingClient};
pub use types::{EmbeddingRequest, EmbeddingResponse};

pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text-v1.5";

/// Concurrent embedding calls per wave
pub const DEFAULT_WAVE_SIZE: usize = 10;
