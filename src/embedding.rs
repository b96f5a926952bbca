//! HTTP client for the external embedding model server (Ollama wire
//! format). Failures surface as typed `Embedder` errors; callers decide
//! whether to degrade to FTS or store messages with null embeddings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::migrations::EMBEDDING_DIM;
use crate::error::{HiveError, Result};

pub const DEFAULT_EMBEDDING_HOST: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_MODEL: &str = "mxbai-embed-large";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub host: String,
    pub model: String,
    pub timeout: Duration,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_EMBEDDING_HOST.to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            dimension: EMBEDDING_DIM,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedderHealth {
    pub available: bool,
    pub model: Option<String>,
}

pub struct EmbeddingClient {
    http: reqwest::Client,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| HiveError::Embedder(err.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(EmbeddingConfig::default())
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.config.host);
        let response = self
            .http
            .post(&url)
            .json(&EmbedRequest {
                model: &self.config.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|err| HiveError::Embedder(err.to_string()))?;
        if !response.status().is_success() {
            return Err(HiveError::Embedder(format!(
                "embedding server returned {}",
                response.status()
            )));
        }
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|err| HiveError::Embedder(err.to_string()))?;
        if body.embedding.len() != self.config.dimension {
            return Err(HiveError::Mismatch(format!(
                "model '{}' returned {} dimensions, expected {}",
                self.config.model,
                body.embedding.len(),
                self.config.dimension
            )));
        }
        Ok(body.embedding)
    }

    /// Embed a batch sequentially; any failure fails the batch. Callers
    /// that need partial results (the session pipeline) embed per item.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    pub async fn check_health(&self) -> EmbedderHealth {
        let url = format!("{}/api/tags", self.config.host);
        let response = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            _ => {
                return EmbedderHealth {
                    available: false,
                    model: None,
                };
            }
        };
        let tags: TagsResponse = response.json().await.unwrap_or(TagsResponse { models: vec![] });
        let model = tags
            .models
            .iter()
            .find(|m| m.name.starts_with(&self.config.model))
            .map(|m| m.name.clone());
        EmbedderHealth {
            available: model.is_some(),
            model,
        }
    }
}
