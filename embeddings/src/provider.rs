//! Embedding providers.
//!
//! Every vendor integration is one instance of [`EmbeddingProvider`]: a
//! `generate` call and a `health` report. Routing code is polymorphic over
//! this trait only, so adding a vendor never touches routing logic.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Request for generating an embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Text to embed.
    pub text: String,

    /// Model the router selected for this call.
    pub model: String,
}

impl EmbeddingRequest {
    /// Create a new embedding request.
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
        }
    }
}

/// Response from embedding generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// The raw vector as produced by the model.
    pub vector: Embedding,

    /// Dimension the provider reports for `vector`.
    pub dimensions: usize,

    /// Actual cost of the call in USD.
    pub cost_usd: f64,

    /// Provider-side latency in milliseconds.
    pub latency_ms: u64,
}

impl EmbeddingResponse {
    /// Check that the response is usable: non-empty, finite, and consistent
    /// with its declared dimension.
    pub fn validate(&self) -> Result<()> {
        if self.vector.is_empty() {
            return Err(EmbeddingError::InvalidResponse("empty vector".to_string()));
        }
        if self.dimensions != self.vector.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: self.vector.len(),
            });
        }
        if self.vector.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::InvalidResponse(
                "non-finite vector component".to_string(),
            ));
        }
        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            return Err(EmbeddingError::InvalidResponse(format!(
                "invalid cost {}",
                self.cost_usd
            )));
        }
        Ok(())
    }
}

/// Coarse health classification reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

/// Health report of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Overall status.
    pub status: HealthStatus,

    /// Observed 99th percentile latency in milliseconds.
    pub observed_p99_latency_ms: u64,

    /// Observed fraction of successful calls (0.0 to 1.0).
    pub observed_availability: f64,
}

impl ProviderHealth {
    /// A healthy report with no observations yet.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            observed_p99_latency_ms: 0,
            observed_availability: 1.0,
        }
    }

    /// An unavailable report.
    pub fn unavailable() -> Self {
        Self {
            status: HealthStatus::Unavailable,
            observed_p99_latency_ms: 0,
            observed_availability: 0.0,
        }
    }
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self::healthy()
    }
}

/// A model served by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier used in agent profiles.
    pub id: String,

    /// Native output dimension.
    pub dimensions: usize,

    /// Price per one million tokens in USD.
    pub cost_per_1m_tokens: f64,
}

impl ModelInfo {
    /// Create a model description.
    pub fn new(id: impl Into<String>, dimensions: usize, cost_per_1m_tokens: f64) -> Self {
        Self {
            id: id.into(),
            dimensions,
            cost_per_1m_tokens,
        }
    }

    /// Price of a single token in USD.
    pub fn cost_per_token(&self) -> f64 {
        self.cost_per_1m_tokens / 1_000_000.0
    }

    /// Estimated cost of embedding `text` with this model.
    pub fn estimate_cost(&self, text: &str) -> f64 {
        estimate_tokens(text) as f64 * self.cost_per_token()
    }
}

/// Coarse token estimate: one token per four bytes of text.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider. Circuit breakers are keyed by it.
    fn name(&self) -> &str;

    /// Models this provider can serve.
    fn models(&self) -> Vec<ModelInfo>;

    /// Generate an embedding for the given text.
    async fn generate(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Report current health.
    async fn health(&self) -> ProviderHealth;
}

/// Rolling window of call outcomes used to derive a health report.
#[derive(Debug)]
pub struct CallStats {
    window: Mutex<VecDeque<(u64, bool)>>,
    capacity: usize,
}

impl CallStats {
    /// Create a window holding the last `capacity` calls.
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Record one call.
    pub fn record(&self, latency_ms: u64, success: bool) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.len() >= self.capacity {
            window.pop_front();
        }
        window.push_back((latency_ms, success));
    }

    /// Derive a health report from the window.
    pub fn health(&self) -> ProviderHealth {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.is_empty() {
            return ProviderHealth::healthy();
        }

        let mut latencies: Vec<u64> = window.iter().map(|(ms, _)| *ms).collect();
        latencies.sort_unstable();
        let rank = (latencies.len() as f64 * 0.99).ceil() as usize;
        let p99 = latencies[rank.clamp(1, latencies.len()) - 1];

        let successes = window.iter().filter(|(_, ok)| *ok).count();
        let availability = successes as f64 / window.len() as f64;

        let status = if availability < 0.5 {
            HealthStatus::Unavailable
        } else if availability < 0.95 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ProviderHealth {
            status,
            observed_p99_latency_ms: p99,
            observed_availability: availability,
        }
    }
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Provider for any endpoint speaking the OpenAI `/embeddings` protocol.
pub struct OpenAiCompatibleProvider {
    /// Provider name.
    name: String,

    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Served models.
    models: Vec<ModelInfo>,

    /// Observed call outcomes.
    stats: CallStats,
}

impl OpenAiCompatibleProvider {
    /// Create a provider against the public OpenAI API.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            models: Vec::new(),
            stats: CallStats::default(),
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Register a served model.
    pub fn with_model(mut self, model: ModelInfo) -> Self {
        self.models.push(model);
        self
    }

    fn model(&self, id: &str) -> Result<&ModelInfo> {
        self.models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| EmbeddingError::ApiRequest(format!("model not served: {id}")))
    }

    async fn call(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EmbeddingError::ProviderNotConfigured)?;
        let model = self.model(&request.model)?;

        debug!("Generating embedding with model: {}", model.id);

        let body = serde_json::json!({
            "input": request.text,
            "model": model.id,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest(format!(
                "API error ({status}): {error_text}"
            )));
        }

        let result: OpenAiEmbeddingResponse = response.json().await?;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let vector = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".to_string()))?
            .embedding;

        let tokens = result
            .usage
            .map(|u| u.total_tokens)
            .unwrap_or_else(|| estimate_tokens(&request.text));

        Ok(EmbeddingResponse {
            dimensions: vector.len(),
            vector,
            cost_usd: tokens as f64 * model.cost_per_token(),
            latency_ms,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn generate(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let started = Instant::now();
        let result = self.call(&request).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(response) => {
                self.stats.record(response.latency_ms, true);
                debug!(
                    "Generated embedding with {} dimensions via {}",
                    response.dimensions, self.name
                );
            }
            Err(err) => {
                self.stats.record(elapsed_ms, false);
                warn!("Embedding call to {} failed: {err}", self.name);
            }
        }

        result
    }

    async fn health(&self) -> ProviderHealth {
        if self.api_key.is_none() {
            return ProviderHealth::unavailable();
        }
        self.stats.health()
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    total_tokens: u64,
}
