//! Agent embedding profiles.
//!
//! A profile tells the router which models an agent may use, in what order,
//! under which budget and latency constraints, and how hard to retry.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutingError};

/// Longest accepted agent identifier, in bytes.
pub const MAX_AGENT_ID_LENGTH: usize = 255;

/// Agent-level policy biasing candidate ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Quality,
    Speed,
    Cost,
    #[default]
    Balanced,
}

impl Strategy {
    /// Whether preferences are consulted by descending weight when the
    /// request names no task type. Otherwise configured order is kept.
    pub fn ranks_by_weight(self) -> bool {
        matches!(self, Strategy::Quality | Strategy::Balanced)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Quality => "quality",
            Strategy::Speed => "speed",
            Strategy::Cost => "cost",
            Strategy::Balanced => "balanced",
        }
    }
}

/// Models to use for one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPreference {
    pub task_type: String,

    /// Tried first, in order. Never empty.
    pub primary_models: Vec<String>,

    /// Tried after every primary, in order.
    #[serde(default)]
    pub fallback_models: Vec<String>,

    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl ModelPreference {
    pub fn new(task_type: impl Into<String>, primary_models: &[&str]) -> Self {
        Self {
            task_type: task_type.into(),
            primary_models: primary_models.iter().map(ToString::to_string).collect(),
            fallback_models: Vec::new(),
            weight: default_weight(),
        }
    }

    pub fn with_fallbacks(mut self, fallback_models: &[&str]) -> Self {
        self.fallback_models = fallback_models.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Per-agent request and token rates. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_hour: u64,
}

/// Limits a candidate must satisfy before it is called.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConstraints {
    /// Monthly spend cap in USD. `None` means uncapped.
    pub max_cost_per_month_usd: Option<f64>,

    /// Highest acceptable observed p99 latency.
    pub max_latency_p99_ms: Option<u64>,

    /// Lowest acceptable observed availability (0.0 to 1.0).
    pub min_availability_sla: Option<f64>,

    pub rate_limits: RateLimits,
}

/// Thresholds of a provider's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,

    /// Time an open breaker waits before admitting probes.
    pub timeout_seconds: u64,

    /// Concurrent probes admitted while half-open.
    pub half_open_max_requests: u32,
}

impl CircuitBreakerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 30,
            half_open_max_requests: 5,
        }
    }
}

/// Retry, backoff and queueing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackBehavior {
    /// Rounds over the candidate list. Zero still runs one round.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,

    /// Hand exhausted requests to the deferred-retry queue.
    pub queue_on_failure: bool,

    pub circuit_breaker: CircuitBreakerSettings,
}

impl FallbackBehavior {
    /// Number of rounds a routing attempt runs.
    pub fn rounds(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Sleep after `round` (1-based) before the next one:
    /// `min(max_delay, initial_delay * base^(round - 1))`.
    pub fn backoff_delay(&self, round: u32) -> Duration {
        let exponent = i32::try_from(round.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay_ms as f64 * self.exponential_base.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for FallbackBehavior {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            exponential_base: 2.0,
            queue_on_failure: false,
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

/// Routing policy of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEmbeddingProfile {
    pub agent_id: String,

    /// Bumped by the profile store on every update.
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub model_preferences: Vec<ModelPreference>,

    #[serde(default)]
    pub constraints: AgentConstraints,

    #[serde(default)]
    pub fallback_behavior: FallbackBehavior,
}

impl AgentEmbeddingProfile {
    pub fn new(agent_id: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            agent_id: agent_id.into(),
            version: 0,
            strategy,
            model_preferences: Vec::new(),
            constraints: AgentConstraints::default(),
            fallback_behavior: FallbackBehavior::default(),
        }
    }

    pub fn with_preference(mut self, preference: ModelPreference) -> Self {
        self.model_preferences.push(preference);
        self
    }

    pub fn with_constraints(mut self, constraints: AgentConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_fallback(mut self, fallback_behavior: FallbackBehavior) -> Self {
        self.fallback_behavior = fallback_behavior;
        self
    }

    /// Check the profile's structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.is_empty() || self.agent_id.len() > MAX_AGENT_ID_LENGTH {
            return Err(invalid(format!(
                "agent_id must be 1 to {MAX_AGENT_ID_LENGTH} bytes"
            )));
        }

        let mut task_types = HashSet::new();
        for preference in &self.model_preferences {
            if !task_types.insert(preference.task_type.as_str()) {
                return Err(invalid(format!(
                    "duplicate preference for task type {}",
                    preference.task_type
                )));
            }
            if preference.primary_models.is_empty() {
                return Err(invalid(format!(
                    "preference for task type {} has no primary models",
                    preference.task_type
                )));
            }
            if !preference.weight.is_finite() {
                return Err(invalid(format!(
                    "preference for task type {} has a non-finite weight",
                    preference.task_type
                )));
            }
        }

        let constraints = &self.constraints;
        if let Some(cap) = constraints
            .max_cost_per_month_usd
            .filter(|cap| !cap.is_finite() || *cap < 0.0)
        {
            return Err(invalid(format!("invalid monthly cost cap {cap}")));
        }
        if let Some(sla) = constraints
            .min_availability_sla
            .filter(|sla| !(0.0..=1.0).contains(sla))
        {
            return Err(invalid(format!("availability sla {sla} outside 0..=1")));
        }

        let fallback = &self.fallback_behavior;
        if !fallback.exponential_base.is_finite() || fallback.exponential_base < 1.0 {
            return Err(invalid(format!(
                "exponential_base {} must be at least 1",
                fallback.exponential_base
            )));
        }
        if fallback.initial_delay_ms > fallback.max_delay_ms {
            return Err(invalid(
                "initial_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }

        let breaker = &fallback.circuit_breaker;
        if breaker.failure_threshold == 0
            || breaker.success_threshold == 0
            || breaker.half_open_max_requests == 0
        {
            return Err(invalid(
                "circuit breaker thresholds must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// The preference configured for `task_type`.
    pub fn preference_for(&self, task_type: &str) -> Option<&ModelPreference> {
        self.model_preferences
            .iter()
            .find(|p| p.task_type == task_type)
    }

    /// Ordered, de-duplicated candidate models for a request.
    ///
    /// With a task type, the matching preference's primaries then fallbacks.
    /// Without one, every preference contributes, ordered by the strategy.
    pub fn candidate_models(&self, task_type: Option<&str>) -> Result<Vec<String>> {
        let preferences: Vec<&ModelPreference> = match task_type {
            Some(task_type) => match self.preference_for(task_type) {
                Some(preference) => vec![preference],
                None => return Err(self.no_preference(task_type)),
            },
            None => {
                let mut all: Vec<&ModelPreference> = self.model_preferences.iter().collect();
                if self.strategy.ranks_by_weight() {
                    // Stable: equal weights keep configured order.
                    all.sort_by(|a, b| b.weight.total_cmp(&a.weight));
                }
                all
            }
        };

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let primaries = preferences.iter().flat_map(|p| p.primary_models.iter());
        let fallbacks = preferences.iter().flat_map(|p| p.fallback_models.iter());
        for model in primaries.chain(fallbacks) {
            if seen.insert(model.as_str()) {
                candidates.push(model.clone());
            }
        }

        if candidates.is_empty() {
            return Err(self.no_preference(task_type.unwrap_or("<default>")));
        }
        Ok(candidates)
    }

    fn no_preference(&self, task_type: &str) -> RoutingError {
        RoutingError::NoModelPreference {
            agent_id: self.agent_id.clone(),
            task_type: task_type.to_string(),
        }
    }
}

fn invalid(message: String) -> RoutingError {
    RoutingError::InvalidProfile(message)
}
