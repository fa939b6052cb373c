//! # Router
//!
//! This crate routes embedding requests to providers on behalf of agents:
//!
//! - **Profiles**: Per-agent strategy, model preferences, constraints and retry policy
//! - **Circuit Breakers**: Per-provider failure gating with bounded half-open probes
//! - **Cost Ledger**: Monthly spend per agent with an advisory budget check
//! - **Batching**: Order-preserving fan-out under a concurrency cap
//! - **Caching**: Repeated requests answered from a TTL-bounded embedding cache
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Model Router                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  BatchCoordinator ──► ModelRouter ◄── AgentEmbeddingProfile     │
//! │                           │                                     │
//! │         ┌─────────────────┼──────────────────┐                  │
//! │         ▼                 ▼                  ▼                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Circuit    │  │     Cost     │  │   Provider   │           │
//! │  │   Breakers   │  │    Ledger    │  │   Registry   │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                              │                  │
//! │                                              ▼                  │
//! │                    DimensionNormalizer ──► EmbeddingStore       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use embedmesh_router::{GenerateRequest, ModelRouter};
//!
//! let router = ModelRouter::builder()
//!     .with_provider(Arc::new(provider))
//!     .build()?;
//!
//! let outcome = router.route(&profile, &GenerateRequest::new("agent", "text", tenant)).await?;
//! ```

pub mod batch;
pub mod breaker;
pub mod config;
pub mod error;
pub mod ledger;
pub mod profile;
pub mod profile_store;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod request;
pub mod router;

pub use batch::BatchCoordinator;
pub use breaker::{BreakerPermit, BreakerRegistry, BreakerStatus, CircuitBreaker, ProviderState};
pub use config::{ProfilesFile, RouterConfig};
pub use error::{
    AttemptOutcome, CandidateAttempt, FailureReason, Result, RoutingError, SkipReason,
};
pub use ledger::{BillingPeriod, BudgetCheck, CostLedger, CostLedgerEntry, CostSummary, LedgerCharge};
pub use profile::{
    AgentConstraints, AgentEmbeddingProfile, CircuitBreakerSettings, FallbackBehavior,
    ModelPreference, RateLimits, Strategy,
};
pub use profile_store::{CacheStats, CachedProfileStore, InMemoryProfileStore, ProfileStore};
pub use queue::{DeferredQueue, InMemoryDeferredQueue, QueueTicket, QueuedRequest};
pub use rate_limit::RateLimiter;
pub use registry::ProviderRegistry;
pub use request::{GenerateRequest, GenerateResponse};
pub use router::{ModelRouter, ModelRouterBuilder, RouteOutcome};

// Re-export from dependencies for convenience
pub use embedmesh_embeddings::{
    DimensionNormalizer, EmbeddingCache, EmbeddingProvider, EmbeddingRecord, EmbeddingStore,
    ModelInfo, ProviderHealth,
};
