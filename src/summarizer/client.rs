use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::types::*;

#[derive(Debug, Error)]
pub enum SummarizerError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[source] reqwest::Error),

    #[error("Server returned error status {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Malformed completion response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// A chat-completions backend
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: CompletionOptions,
    ) -> Result<String, SummarizerError>;
}

pub struct ChatClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl ChatClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, Duration::from_secs(60))
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: super::DEFAULT_CHAT_MODEL.to_string(),
            api_key: None,
            timeout,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn map_transport(&self, err: reqwest::Error) -> SummarizerError {
        if err.is_timeout() {
            SummarizerError::Timeout(self.timeout)
        } else {
            SummarizerError::RequestFailed(err)
        }
    }

    async fn checked_body(&self, response: reqwest::Response) -> Result<String, SummarizerError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_transport(e))?;
        if !status.is_success() {
            return Err(SummarizerError::ServerError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    /// Check the server is up and lists the configured model
    pub async fn health_check(&self) -> Result<HealthResponse, SummarizerError> {
        let response = self
            .authorize(self.http.get(format!("{}/models", self.endpoint)))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let body = self.checked_body(response).await?;
        let list: ModelList = serde_json::from_str(&body)?;
        let available_models: Vec<String> = list.data.into_iter().map(|m| m.id).collect();

        Ok(HealthResponse {
            model_available: available_models.iter().any(|m| m == &self.model),
            model: self.model.clone(),
            available_models,
        })
    }

    /// Free-form question from the presenter about the collected questions
    pub async fn answer_host_query(
        &self,
        query: &str,
        context: &str,
    ) -> Result<String, SummarizerError> {
        let messages = super::prompt::host_query_messages(query, context);
        self.complete(
            &messages,
            CompletionOptions {
                temperature: 0.5,
                max_tokens: 1024,
                ..CompletionOptions::default()
            },
        )
        .await
    }
}

#[async_trait]
impl Generator for ChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: CompletionOptions,
    ) -> Result<String, SummarizerError> {
        let req = ChatRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
        };

        let response = self
            .authorize(self.http.post(format!("{}/chat/completions", self.endpoint)))
            .json(&req)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let body = self.checked_body(response).await?;
        let res: ChatResponse = serde_json::from_str(&body)?;
        let content = res.into_content();

        debug!(model = %self.model, chars = content.len(), "chat completion received");
        Ok(content)
    }
}
