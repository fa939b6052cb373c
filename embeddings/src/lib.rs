//! # Embeddings
//!
//! This crate provides the provider-facing half of the embedmesh routing
//! engine: the capability every embedding vendor implements, the transform
//! that makes vectors from different models comparable, and the storage
//! boundary for generated records.
//!
//! ## Features
//!
//! - **Provider Capability**: One `generate` + `health` contract for every vendor
//! - **Dimension Normalization**: Map any model's output to the standard dimension
//! - **Similarity Search**: Cosine search over normalized records
//! - **Embedding Cache**: TTL-bounded reuse of records for repeated requests
//! - **HTTP Provider**: OpenAI-compatible `/embeddings` adapter
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► DimensionNormalizer ──► EmbeddingStore   │
//! │       │                        │                    │           │
//! │       ▼                        ▼                    ▼           │
//! │  OpenAI-compatible       unit-length D        SearchByModel     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod error;
pub mod normalize;
pub mod provider;
pub mod similarity;
pub mod store;

pub use cache::{CacheKey, CacheStats, DEFAULT_CACHE_TTL, EmbeddingCache};
pub use error::{EmbeddingError, Result};
pub use normalize::{DimensionNormalizer, l2_normalize, normalize_dimensions};
pub use provider::{
    CallStats, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, HealthStatus, ModelInfo,
    OpenAiCompatibleProvider, ProviderHealth, estimate_tokens,
};
pub use similarity::{SimilarityResult, cosine_similarity};
pub use store::{
    EmbeddingRecord, EmbeddingStore, InMemoryEmbeddingStore, ScoredRecord, SearchQuery,
};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Standard dimension every stored embedding is normalized to.
pub const STANDARD_DIMENSION: usize = 1536; // OpenAI text-embedding-3-small
