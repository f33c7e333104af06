//! Semantic index over block text and structured fields.
//!
//! A derived, rebuildable vector store: cosine similarity over embeddings
//! with namespace/type/tag filters. State persists as a JSON file under the
//! configured index path; losing it only costs a rebuild.
//!
//! Consistency: the facade updates the index *after* the SQL commit
//! succeeds. Failures there surface as `IndexSyncFailed` and are re-driven
//! by the [`reconciler`], which scans `block_proofs` for commit hashes the
//! index has not observed.

pub mod embedding;
pub mod reconciler;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::IndexConfig;
use crate::error::{MemoryBankError, Result};
use crate::index::embedding::EmbeddingProvider;
use crate::model::MemoryBlock;

const SNIPPET_LENGTH: usize = 160;

/// One indexed block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub block_id: String,
    pub namespace_id: String,
    pub node_type: String,
    pub tags: Vec<String>,
    pub snippet: String,
    pub embedding: Vec<f32>,
    /// Hash of the commit this entry reflects, when known.
    pub commit_hash: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    collection: String,
    entries: HashMap<String, IndexEntry>,
    /// Highest `block_proofs.id` the index has observed.
    last_observed_proof: i64,
}

/// A semantic-search query.
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub text: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub namespace: Option<String>,
    pub node_type: Option<String>,
    pub tags: Vec<String>,
    pub k: usize,
}

/// One search hit.
#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub snippet: String,
}

/// The in-process vector index.
///
/// Queries take a read lock and run concurrently; upserts take the write
/// lock, which also serializes concurrent upserts of the same block id.
pub struct SemanticIndex {
    provider: Arc<dyn EmbeddingProvider>,
    state: RwLock<IndexState>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SemanticIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticIndex")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SemanticIndex {
    /// An index that lives only in memory (tests, throwaway work).
    #[must_use]
    pub fn in_memory(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            state: RwLock::new(IndexState::default()),
            path: None,
        }
    }

    /// Open the index at the configured path, loading persisted state when
    /// present. A corrupt state file is discarded with a warning: the index
    /// is derived data and a rebuild restores it.
    #[must_use]
    pub fn open(config: &IndexConfig, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let state = match std::fs::read_to_string(&config.path) {
            Ok(contents) => match serde_json::from_str::<IndexState>(&contents) {
                Ok(state) => state,
                Err(err) => {
                    warn!(path = %config.path.display(), error = %err,
                        "discarding unreadable index state; rebuild required");
                    IndexState::default()
                }
            },
            Err(_) => IndexState {
                collection: config.collection.clone(),
                ..IndexState::default()
            },
        };

        Self {
            provider,
            state: RwLock::new(state),
            path: Some(config.path.clone()),
        }
    }

    /// Index (or re-index) a block.
    ///
    /// Uses the block's precomputed embedding when present, otherwise embeds
    /// the block text plus a summary of its structured fields.
    ///
    /// # Errors
    ///
    /// `IndexSyncFailed` wrapping the provider or persistence failure.
    pub async fn upsert(&self, block: &MemoryBlock, commit_hash: Option<&str>) -> Result<()> {
        let embedding = match &block.embedding {
            Some(embedding) if !embedding.is_empty() => embedding.clone(),
            _ => self
                .provider
                .embed(&embedding_text(block))
                .await
                .map_err(|e| MemoryBankError::IndexSync {
                    id: block.id.clone(),
                    reason: e.to_string(),
                })?,
        };

        let entry = IndexEntry {
            block_id: block.id.clone(),
            namespace_id: block.namespace_id.clone(),
            node_type: block.node_type.clone(),
            tags: block.tags.clone(),
            snippet: snippet(&block.text),
            embedding,
            commit_hash: commit_hash.map(str::to_string),
        };

        let mut state = self.state.write().await;
        state.entries.insert(block.id.clone(), entry);
        self.persist(&state, &block.id)?;
        debug!(block_id = %block.id, "indexed block");
        Ok(())
    }

    /// Remove a block from the index. Removing an absent id is a no-op.
    ///
    /// # Errors
    ///
    /// `IndexSyncFailed` on persistence failure.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.entries.remove(id);
        self.persist(&state, id)?;
        Ok(())
    }

    /// Cosine-similarity search with attribute filters.
    ///
    /// # Errors
    ///
    /// `Validation` when neither text nor embedding is given;
    /// `IndexSyncFailed` when the query text cannot be embedded.
    pub async fn query(&self, query: &IndexQuery) -> Result<Vec<SearchHit>> {
        let needle = match (&query.embedding, &query.text) {
            (Some(embedding), _) => embedding.clone(),
            (None, Some(text)) => {
                self.provider
                    .embed(text)
                    .await
                    .map_err(|e| MemoryBankError::IndexSync {
                        id: "query".to_string(),
                        reason: e.to_string(),
                    })?
            }
            (None, None) => {
                return Err(MemoryBankError::Validation {
                    entity: "semantic query".to_string(),
                    reason: "either text or embedding is required".to_string(),
                });
            }
        };

        let state = self.state.read().await;
        let mut hits: Vec<SearchHit> = state
            .entries
            .values()
            .filter(|entry| {
                query
                    .namespace
                    .as_ref()
                    .is_none_or(|ns| &entry.namespace_id == ns)
                    && query
                        .node_type
                        .as_ref()
                        .is_none_or(|t| &entry.node_type == t)
                    && query.tags.iter().all(|tag| entry.tags.contains(tag))
            })
            .map(|entry| SearchHit {
                id: entry.block_id.clone(),
                score: cosine_similarity(&needle, &entry.embedding),
                snippet: entry.snippet.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(query.k.max(1));
        Ok(hits)
    }

    /// Replace the whole index with the given blocks. Idempotent.
    ///
    /// # Errors
    ///
    /// `IndexSyncFailed` when any block cannot be embedded or state cannot
    /// be persisted.
    pub async fn rebuild_from(&self, blocks: &[MemoryBlock]) -> Result<usize> {
        let mut entries = HashMap::new();
        for block in blocks {
            let embedding = match &block.embedding {
                Some(embedding) if !embedding.is_empty() => embedding.clone(),
                _ => self
                    .provider
                    .embed(&embedding_text(block))
                    .await
                    .map_err(|e| MemoryBankError::IndexSync {
                        id: block.id.clone(),
                        reason: e.to_string(),
                    })?,
            };
            entries.insert(
                block.id.clone(),
                IndexEntry {
                    block_id: block.id.clone(),
                    namespace_id: block.namespace_id.clone(),
                    node_type: block.node_type.clone(),
                    tags: block.tags.clone(),
                    snippet: snippet(&block.text),
                    embedding,
                    commit_hash: None,
                },
            );
        }

        let count = entries.len();
        let mut state = self.state.write().await;
        state.entries = entries;
        self.persist(&state, "rebuild")?;
        Ok(count)
    }

    /// Whether a block is present in the index.
    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.entries.contains_key(id)
    }

    /// Number of indexed blocks.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Highest proof id the reconciler has observed.
    pub async fn last_observed_proof(&self) -> i64 {
        self.state.read().await.last_observed_proof
    }

    /// Advance the reconciler high-water mark.
    ///
    /// # Errors
    ///
    /// `IndexSyncFailed` on persistence failure.
    pub async fn set_last_observed_proof(&self, proof_id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        if proof_id > state.last_observed_proof {
            state.last_observed_proof = proof_id;
            self.persist(&state, "high-water")?;
        }
        Ok(())
    }

    fn persist(&self, state: &IndexState, context: &str) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let serialized = serde_json::to_string(state)?;
            std::fs::write(path, serialized)
        };

        write().map_err(|e| MemoryBankError::IndexSync {
            id: context.to_string(),
            reason: format!("persisting index state to {}: {e}", path.display()),
        })
    }
}

/// The text handed to the embedder: block text plus a compact rendering of
/// title-like metadata fields and tags.
#[must_use]
pub fn embedding_text(block: &MemoryBlock) -> String {
    let mut parts = vec![block.text.clone()];

    if let serde_json::Value::Object(fields) = &block.metadata {
        for key in ["title", "name", "subject", "description"] {
            if let Some(serde_json::Value::String(value)) = fields.get(key) {
                parts.push(format!("{key}: {value}"));
            }
        }
    }
    if !block.tags.is_empty() {
        parts.push(format!("tags: {}", block.tags.join(", ")));
    }

    parts.join("\n")
}

fn snippet(text: &str) -> String {
    if text.len() <= SNIPPET_LENGTH {
        return text.to_string();
    }
    let mut end = SNIPPET_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::embedding::HashEmbedder;
    use crate::model::MemoryBlock;

    fn index() -> SemanticIndex {
        SemanticIndex::in_memory(Arc::new(HashEmbedder::default()))
    }

    fn block(id: &str, text: &str) -> MemoryBlock {
        MemoryBlock::new(id, "doc", text, "tester")
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn identical_text_ranks_first() {
        let index = index();
        index.upsert(&block("mb-1", "rust async runtimes"), None).await.unwrap();
        index.upsert(&block("mb-2", "gardening tips"), None).await.unwrap();
        index.upsert(&block("mb-3", "sourdough starters"), None).await.unwrap();

        let hits = index
            .query(&IndexQuery {
                text: Some("rust async runtimes".to_string()),
                k: 2,
                ..IndexQuery::default()
            })
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "mb-1");
        assert!((hits[0].score - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn filters_restrict_candidates() {
        let index = index();
        let mut a = block("mb-a", "same text");
        a.node_type = "task".to_string();
        a.tags = vec!["urgent".to_string()];
        let mut b = block("mb-b", "same text");
        b.node_type = "doc".to_string();

        index.upsert(&a, None).await.unwrap();
        index.upsert(&b, None).await.unwrap();

        let hits = index
            .query(&IndexQuery {
                text: Some("same text".to_string()),
                node_type: Some("task".to_string()),
                k: 10,
                ..IndexQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "mb-a");

        let hits = index
            .query(&IndexQuery {
                text: Some("same text".to_string()),
                tags: vec!["urgent".to_string()],
                k: 10,
                ..IndexQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "mb-a");
    }

    #[tokio::test]
    async fn remove_then_query_excludes() {
        let index = index();
        index.upsert(&block("mb-1", "hello world"), None).await.unwrap();
        assert!(index.contains("mb-1").await);

        index.remove("mb-1").await.unwrap();
        assert!(!index.contains("mb-1").await);

        let hits = index
            .query(&IndexQuery {
                text: Some("hello world".to_string()),
                k: 5,
                ..IndexQuery::default()
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn query_without_input_is_rejected() {
        let index = index();
        let err = index.query(&IndexQuery::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn precomputed_embedding_wins_over_provider() {
        let index = index();
        let mut b = block("mb-1", "text");
        b.embedding = Some(vec![1.0, 0.0, 0.0]);
        index.upsert(&b, None).await.unwrap();

        let hits = index
            .query(&IndexQuery {
                embedding: Some(vec![1.0, 0.0, 0.0]),
                k: 1,
                ..IndexQuery::default()
            })
            .await
            .unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn rebuild_replaces_everything() {
        let index = index();
        index.upsert(&block("stale", "old"), None).await.unwrap();

        let fresh = vec![block("mb-1", "one"), block("mb-2", "two")];
        let count = index.rebuild_from(&fresh).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(index.len().await, 2);
        assert!(!index.contains("stale").await);

        // Idempotent.
        let count = index.rebuild_from(&fresh).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(index.len().await, 2);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            path: dir.path().join("index.json"),
            ..IndexConfig::default()
        };

        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::default());
        let index = SemanticIndex::open(&config, Arc::clone(&provider));
        index.upsert(&block("mb-1", "persist me"), Some("abc123")).await.unwrap();
        index.set_last_observed_proof(42).await.unwrap();

        let reopened = SemanticIndex::open(&config, provider);
        assert!(reopened.contains("mb-1").await);
        assert_eq!(reopened.last_observed_proof().await, 42);
    }

    #[test]
    fn embedding_text_includes_structured_fields() {
        let mut b = block("mb-1", "body text");
        b.metadata = serde_json::json!({ "title": "The Title", "count": 3 });
        b.tags = vec!["alpha".to_string(), "beta".to_string()];

        let text = embedding_text(&b);
        assert!(text.contains("body text"));
        assert!(text.contains("title: The Title"));
        assert!(text.contains("tags: alpha, beta"));
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let text = "é".repeat(200);
        let s = snippet(&text);
        assert!(s.ends_with('…'));
        assert!(s.chars().count() <= SNIPPET_LENGTH + 1);
    }
}
