//! Embedding record storage.
//!
//! Records are immutable once written. Search compares only records whose
//! normalized dimension equals the query's, scoped to one tenant and model.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::find_top_k;

/// One successful generation, normalized to the standard dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Unique identifier.
    pub embedding_id: Uuid,

    /// Agent that requested the embedding.
    pub agent_id: String,

    /// Owning tenant.
    pub tenant_id: Uuid,

    /// Optional context the embedding belongs to.
    pub context_id: Option<Uuid>,

    /// Model that produced the raw vector.
    pub model_id: String,

    /// Provider that served the model.
    pub provider: String,

    /// Dimension of the raw provider vector.
    pub raw_dimensions: usize,

    /// Dimension of `vector`.
    pub normalized_dimensions: usize,

    /// The normalized vector.
    pub vector: Embedding,

    /// Cost of the generation in USD.
    pub cost_usd: f64,

    /// Wall-clock time spent generating, in milliseconds.
    pub generation_time_ms: u64,

    /// Time the provider reported for its own call, in milliseconds.
    #[serde(default)]
    pub provider_latency_ms: u64,

    /// Served from the embedding cache rather than a provider call.
    #[serde(default)]
    pub cached: bool,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Caller metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Parameters of a model-scoped similarity search.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub tenant_id: Uuid,
    /// When set, only records from this context match.
    pub context_id: Option<Uuid>,
    pub model_id: String,
    pub vector: Embedding,
    pub top_k: usize,
    pub min_similarity: f32,
}

/// A record with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: EmbeddingRecord,
    pub similarity: f32,
}

/// Storage boundary for embedding records.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Persist a record.
    async fn put(&self, record: EmbeddingRecord) -> Result<()>;

    /// Nearest-neighbor search by tenant, context and model.
    async fn search_by_model(&self, query: &SearchQuery) -> Result<Vec<ScoredRecord>>;
}

/// In-memory [`EmbeddingStore`] for a fixed standard dimension.
pub struct InMemoryEmbeddingStore {
    records: RwLock<HashMap<Uuid, EmbeddingRecord>>,
    dimension: usize,
}

impl InMemoryEmbeddingStore {
    /// Create an empty store accepting vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dimension,
        }
    }

    /// Get a record by ID.
    pub async fn get(&self, embedding_id: Uuid) -> Option<EmbeddingRecord> {
        self.records.read().await.get(&embedding_id).cloned()
    }

    /// Get the number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryEmbeddingStore {
    async fn put(&self, record: EmbeddingRecord) -> Result<()> {
        if record.vector.len() != record.normalized_dimensions
            || record.normalized_dimensions != self.dimension
        {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: record.vector.len(),
            });
        }

        let mut records = self.records.write().await;
        if records.contains_key(&record.embedding_id) {
            return Err(EmbeddingError::Store(format!(
                "record already exists: {}",
                record.embedding_id
            )));
        }

        debug!(
            "Stored embedding {} ({} via {})",
            record.embedding_id, record.model_id, record.provider
        );
        records.insert(record.embedding_id, record);
        Ok(())
    }

    async fn search_by_model(&self, query: &SearchQuery) -> Result<Vec<ScoredRecord>> {
        if query.vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: query.vector.len(),
            });
        }

        let records = self.records.read().await;
        let candidates = records
            .values()
            .filter(|r| r.tenant_id == query.tenant_id && r.model_id == query.model_id)
            .filter(|r| query.context_id.is_none() || r.context_id == query.context_id)
            .filter(|r| r.normalized_dimensions == query.vector.len())
            .map(|r| (r.embedding_id, r.vector.as_slice()));

        let hits = find_top_k(&query.vector, candidates, query.top_k, query.min_similarity)?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                records.get(&hit.id).map(|record| ScoredRecord {
                    record: record.clone(),
                    similarity: hit.score,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(tenant_id: Uuid, model_id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            embedding_id: Uuid::new_v4(),
            agent_id: "agent".to_string(),
            tenant_id,
            context_id: None,
            model_id: model_id.to_string(),
            provider: "provider".to_string(),
            raw_dimensions: vector.len(),
            normalized_dimensions: vector.len(),
            vector,
            cost_usd: 0.0,
            generation_time_ms: 1,
            provider_latency_ms: 1,
            cached: false,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    fn query(tenant_id: Uuid, model_id: &str, vector: Vec<f32>) -> SearchQuery {
        SearchQuery {
            tenant_id,
            context_id: None,
            model_id: model_id.to_string(),
            vector,
            top_k: 10,
            min_similarity: 0.0,
        }
    }

    #[tokio::test]
    async fn test_put_and_search() {
        let store = InMemoryEmbeddingStore::new(3);
        let tenant = Uuid::new_v4();
        let close = record(tenant, "m", vec![1.0, 0.0, 0.0]);
        let far = record(tenant, "m", vec![0.0, 1.0, 0.0]);
        store.put(close.clone()).await.unwrap();
        store.put(far).await.unwrap();

        let results = store
            .search_by_model(&query(tenant, "m", vec![1.0, 0.1, 0.0]))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record.embedding_id, close.embedding_id);
    }

    #[tokio::test]
    async fn test_search_scoped_to_tenant_model_and_context() {
        let store = InMemoryEmbeddingStore::new(2);
        let tenant = Uuid::new_v4();
        let context = Uuid::new_v4();

        let mut in_context = record(tenant, "m", vec![1.0, 0.0]);
        in_context.context_id = Some(context);
        store.put(in_context.clone()).await.unwrap();
        store.put(record(tenant, "m", vec![1.0, 0.0])).await.unwrap();
        store.put(record(tenant, "other", vec![1.0, 0.0])).await.unwrap();
        store
            .put(record(Uuid::new_v4(), "m", vec![1.0, 0.0]))
            .await
            .unwrap();

        let all = store
            .search_by_model(&query(tenant, "m", vec![1.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let mut scoped = query(tenant, "m", vec![1.0, 0.0]);
        scoped.context_id = Some(context);
        let results = store.search_by_model(&scoped).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.embedding_id, in_context.embedding_id);
    }

    #[tokio::test]
    async fn test_query_dimension_must_match() {
        let store = InMemoryEmbeddingStore::new(3);
        let result = store
            .search_by_model(&query(Uuid::new_v4(), "m", vec![1.0, 0.0]))
            .await;
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_dimension_and_duplicates() {
        let store = InMemoryEmbeddingStore::new(3);
        let tenant = Uuid::new_v4();
        assert!(store.put(record(tenant, "m", vec![1.0])).await.is_err());

        let r = record(tenant, "m", vec![1.0, 0.0, 0.0]);
        store.put(r.clone()).await.unwrap();
        assert!(matches!(store.put(r).await, Err(EmbeddingError::Store(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_top_k_and_min_similarity() {
        let store = InMemoryEmbeddingStore::new(2);
        let tenant = Uuid::new_v4();
        for v in [[1.0, 0.0], [0.9, 0.1], [0.0, 1.0], [-1.0, 0.0]] {
            store.put(record(tenant, "m", v.to_vec())).await.unwrap();
        }

        let mut q = query(tenant, "m", vec![1.0, 0.0]);
        q.min_similarity = 0.5;
        assert_eq!(store.search_by_model(&q).await.unwrap().len(), 2);

        q.top_k = 1;
        q.min_similarity = -1.0;
        let top = store.search_by_model(&q).await.unwrap();
        assert_eq!(top.len(), 1);
        assert!((top[0].similarity - 1.0).abs() < 1e-6);
    }
}
