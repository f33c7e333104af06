//! Embedding providers for the semantic index.
//!
//! Two implementations: a deterministic local embedder (no external service,
//! stable across runs, good enough for filtering and tests) and an HTTP
//! provider speaking the Ollama embeddings API.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::error::{MemoryBankError, Result};

/// Something that can turn text into a dense vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Embed one text.
    ///
    /// # Errors
    ///
    /// Transport or response errors from the backing service.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deterministic local embedder seeded from a content hash.
///
/// Not semantically meaningful, but stable: identical text always maps to
/// the identical vector, so similarity search degrades to exact/near-exact
/// matching instead of failing when no embedding service is configured.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let digest = Sha256::digest(text.as_bytes());
        let seed = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));

        let mut vector: Vec<f32> = (0..self.dimensions)
            .map(|i| {
                let x = (seed.wrapping_add(i as u64)) as f64 * 0.1;
                (x.sin() * 0.5 + 0.5) as f32
            })
            .collect();

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// HTTP provider for an Ollama-compatible `/api/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    #[must_use]
    pub fn new(endpoint: &str, model: &str, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| MemoryBankError::Connection {
                message: format!("embedding service at {url}: {e}"),
                saturated: false,
            })?;

        if !response.status().is_success() {
            return Err(MemoryBankError::Connection {
                message: format!(
                    "embedding service at {url} returned {}",
                    response.status()
                ),
                saturated: false,
            });
        }

        let body: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| MemoryBankError::Validation {
                    entity: "embedding response".to_string(),
                    reason: e.to_string(),
                })?;

        if body.embedding.is_empty() {
            return Err(MemoryBankError::Validation {
                entity: "embedding response".to_string(),
                reason: "service returned an empty vector".to_string(),
            });
        }

        Ok(body.embedding)
    }
}

/// Pick the provider the config asks for.
#[must_use]
pub fn provider_from_config(config: &IndexConfig) -> Arc<dyn EmbeddingProvider> {
    match &config.embedding_endpoint {
        Some(endpoint) => Arc::new(HttpEmbedder::new(endpoint, &config.embedding_model, 768)),
        None => Arc::new(HashEmbedder::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("write the spec").await.unwrap();
        let b = embedder.embed("write the spec").await.unwrap();
        let c = embedder.embed("something else entirely").await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), embedder.dimensions());

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "vector should be unit length");
    }

    #[tokio::test]
    async fn http_embedder_round_trips() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(
                serde_json::json!({ "model": "nomic-embed-text" }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "embedding": [0.1, 0.2, 0.3] }),
            ))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(&server.uri(), "nomic-embed-text", 3);
        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn http_embedder_surfaces_service_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(&server.uri(), "nomic-embed-text", 3);
        let err = embedder.embed("hello").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionError);
    }
}
