//! Error types for the routing engine.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors that can occur while routing embedding requests.
#[derive(Error, Debug)]
pub enum RoutingError {
    /// The profile has no preference for the requested task type.
    #[error("no model preference for agent {agent_id} and task type {task_type}")]
    NoModelPreference { agent_id: String, task_type: String },

    /// Every candidate was skipped or failed in every round.
    #[error("all providers exhausted after {} attempts", attempts.len())]
    AllProvidersExhausted { attempts: Vec<CandidateAttempt> },

    /// The caller canceled the request.
    #[error("request canceled")]
    Canceled,

    /// Request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Profile failed validation.
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// No profile stored for the agent.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// Agent exceeded its request or token rate.
    #[error("rate limit exceeded for agent {agent_id}, retry after {retry_after_secs}s")]
    RateLimited {
        agent_id: String,
        retry_after_secs: u64,
    },

    /// Batch larger than the configured maximum.
    #[error("batch of {size} requests exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    /// Deferred-retry queue rejected the request.
    #[error("queue error: {0}")]
    Queue(String),

    /// Normalization or storage error.
    #[error("embedding error: {0}")]
    Embedding(#[from] embedmesh_embeddings::EmbeddingError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// TOML parse error.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One candidate considered during a routing attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateAttempt {
    /// Round in which the candidate was considered (1-based).
    pub round: u32,

    /// Model from the profile's candidate list.
    pub model_id: String,

    /// Provider serving the model, if it is registered.
    pub provider: Option<String>,

    /// What happened.
    pub outcome: AttemptOutcome,
}

/// Why a candidate did not produce an embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Not attempted.
    Skipped(SkipReason),
    /// Attempted and failed; counted against the provider's breaker.
    Failed(FailureReason),
}

/// Reasons a candidate is skipped without calling its provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    /// Model id not served by any registered provider.
    UnknownModel,
    /// Breaker open, or half-open with all probe slots taken.
    CircuitOpen,
    /// Projected spend would exceed the monthly cap.
    BudgetExceeded {
        accumulated_usd: f64,
        estimated_usd: f64,
        cap_usd: f64,
    },
    /// Provider reported itself unavailable.
    ProviderUnavailable,
    /// Observed p99 latency above the agent's limit.
    LatencyAboveLimit { observed_p99_ms: u64, limit_ms: u64 },
    /// Observed availability below the agent's SLA.
    AvailabilityBelowSla { observed: f64, required: f64 },
}

/// Reasons a provider call failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Provider returned an error.
    ProviderError(String),
    /// Call exceeded the provider timeout.
    Timeout { after_ms: u64 },
    /// Provider answered with an unusable vector.
    InvalidResponse(String),
}

impl fmt::Display for CandidateAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let provider = self.provider.as_deref().unwrap_or("-");
        write!(
            f,
            "round {} {} ({provider}): {}",
            self.round, self.model_id, self.outcome
        )
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Skipped(reason) => write!(f, "skipped, {reason}"),
            AttemptOutcome::Failed(reason) => write!(f, "failed, {reason}"),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnknownModel => write!(f, "unknown model"),
            SkipReason::CircuitOpen => write!(f, "circuit open"),
            SkipReason::BudgetExceeded {
                accumulated_usd,
                estimated_usd,
                cap_usd,
            } => write!(
                f,
                "budget exceeded ({accumulated_usd:.4} + {estimated_usd:.4} > {cap_usd:.4} USD)"
            ),
            SkipReason::ProviderUnavailable => write!(f, "provider unavailable"),
            SkipReason::LatencyAboveLimit {
                observed_p99_ms,
                limit_ms,
            } => write!(f, "p99 {observed_p99_ms}ms above limit {limit_ms}ms"),
            SkipReason::AvailabilityBelowSla { observed, required } => {
                write!(f, "availability {observed:.3} below sla {required:.3}")
            }
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ProviderError(message) => write!(f, "provider error: {message}"),
            FailureReason::Timeout { after_ms } => write!(f, "timed out after {after_ms}ms"),
            FailureReason::InvalidResponse(message) => write!(f, "invalid response: {message}"),
        }
    }
}
