//! Embedding and chat capability.
//!
//! The rest of the crate treats embedding as a black-box capability:
//! `embed(texts) -> vectors`, order-preserving, fallible. Two providers
//! exist:
//!
//! - [`DisabledProvider`] — returned when no backend is configured; every
//!   call fails with [`EmbeddingError::NotConfigured`].
//! - [`OpenAiCompatProvider`] — talks to any OpenAI-compatible HTTP
//!   backend (`/v1/embeddings`, `/v1/chat/completions`) with exponential
//!   backoff on transient failures.
//!
//! Also home to the vector plumbing shared by the store and the
//! retriever: little-endian f32 blob codecs, dot product, and L2 norm.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::EmbeddingConfig;

/// Failure modes of the embedding/chat capability.
///
/// `NotConfigured` is a configuration error and fails fast; the other
/// variants are backend errors the indexer degrades on per batch.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding backend not configured (set embedding.base_url and embedding.model)")]
    NotConfigured,
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding backend returned HTTP {status}: {body}")]
    Backend { status: u16, body: String },
    #[error("unexpected response from embedding backend: {0}")]
    BadResponse(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Whether this provider can actually serve requests.
    fn is_enabled(&self) -> bool;
    /// Model identifier stored alongside each vector.
    fn model_name(&self) -> &str;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Instantiate the provider described by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Box<dyn EmbeddingProvider>> {
    if !config.is_enabled() {
        return Ok(Box::new(DisabledProvider));
    }
    Ok(Box::new(OpenAiCompatProvider::new(config)?))
}

// ============ Disabled provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn is_enabled(&self) -> bool {
        false
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::NotConfigured)
    }
}

// ============ OpenAI-compatible provider ============

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: Option<String>,
    model: String,
    chat_model: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            api_key,
            model: config.model.trim().to_string(),
            chat_model: config.chat_model.trim().to_string(),
            max_retries: config.max_retries,
            client,
        })
    }

    /// Chat completion, consumed by the answer-generation collaborator.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, EmbeddingError> {
        if self.chat_model.is_empty() {
            return Err(EmbeddingError::NotConfigured);
        }
        let body = serde_json::json!({
            "model": self.chat_model,
            "messages": messages,
            "stream": false,
        });
        let json = self
            .post_json(&format!("{}/v1/chat/completions", self.base_url), &body)
            .await?;
        json.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| EmbeddingError::BadResponse("missing choices[0].message.content".into()))
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, EmbeddingError> {
        let mut last_err: Option<EmbeddingError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Backoff 0.5s doubling per attempt, capped at 8s.
                let millis = std::cmp::min(8_000, 500u64 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }

            let mut request = self.client.post(url).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<serde_json::Value>().await?);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    let err = EmbeddingError::Backend {
                        status: status.as_u16(),
                        body: body_text,
                    };
                    // Rate limits and server errors are worth retrying;
                    // other client errors are not.
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EmbeddingError::BadResponse("request failed without error".into())))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatProvider {
    fn is_enabled(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self
            .post_json(&format!("{}/v1/embeddings", self.base_url), &body)
            .await?;
        parse_embeddings_response(&json)
    }
}

/// Extract `data[].embedding` arrays, ordered by `data[].index` so the
/// output always matches the input order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::BadResponse("missing data array".into()))?;

    let mut indexed: Vec<(i64, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::BadResponse("missing embedding".into()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Vector plumbing ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`]. Trailing bytes that do not
/// form a whole f32 are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn l2_norm(vec: &[f32]) -> f64 {
    vec.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>().sqrt()
}

/// Dot product over the shorter of the two vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| f64::from(x) * f64::from(y))
        .sum()
}
