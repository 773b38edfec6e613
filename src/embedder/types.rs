// the embedding endpoint contract
use serde::{Deserialize, Serialize};

use super::client::EmbedError;

#[derive(Debug, Serialize)]
pub struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub input: &'a str,
}

/// Response bodies seen from the embedding services we talk to.
///
/// Variants are tried in order, so an object carrying `embedding` wins over
/// one carrying `data`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingResponse {
    /// `{"embedding": [...]}`
    Direct { embedding: Vec<f32> },
    /// `{"data": [{"embedding": [...]}, ...]}`
    OpenAi { data: Vec<EmbeddingDatum> },
    /// `[...]`
    Bare(Vec<f32>),
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingDatum {
    pub embedding: Vec<f32>,
}

impl EmbeddingResponse {
    /// Normalize any accepted shape to a single vector
    pub fn into_vector(self) -> Result<Vec<f32>, EmbedError> {
        let vector = match self {
            EmbeddingResponse::Direct { embedding } => embedding,
            EmbeddingResponse::OpenAi { data } => data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or(EmbedError::EmptyVector)?,
            EmbeddingResponse::Bare(v) => v,
        };

        if vector.is_empty() {
            return Err(EmbedError::EmptyVector);
        }
        Ok(vector)
    }
}
