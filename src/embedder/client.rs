// client.rs - the HTTP embedder
use crate::embedder::types::*;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Every variant means the text has no embedding for this run
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Embedding request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Embedding server returned status {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Unrecognized embedding response: {0}")]
    UnrecognizedShape(String),

    #[error("Embedding response contained no vector")]
    EmptyVector,
}

/// Text to vector, one text at a time
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

pub struct EmbeddingClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, Duration::from_secs(15))
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: super::DEFAULT_EMBEDDING_MODEL.to_string(),
            api_key: None,
            timeout,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sent as a bearer token; an empty key sends no header
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn map_transport(&self, err: reqwest::Error) -> EmbedError {
        if err.is_timeout() {
            EmbedError::Timeout(self.timeout)
        } else {
            EmbedError::Request(err)
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let req = EmbeddingRequest {
            model: &self.model,
            input: text,
        };

        let mut builder = self
            .http
            .post(format!("{}/embeddings", self.endpoint))
            .json(&req);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.map_transport(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_transport(e))?;
        if !status.is_success() {
            return Err(EmbedError::Server {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|_| EmbedError::UnrecognizedShape(body.chars().take(200).collect()))?;
        let vector = parsed.into_vector()?;

        debug!(model = %self.model, dim = vector.len(), "embedded text");
        Ok(vector)
    }
}
