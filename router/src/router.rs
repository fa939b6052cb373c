//! Model router implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use embedmesh_embeddings::{
    CacheKey, DimensionNormalizer, EmbeddingCache, EmbeddingProvider, EmbeddingRecord,
    EmbeddingRequest, EmbeddingResponse, EmbeddingStore, HealthStatus, InMemoryEmbeddingStore,
    ModelInfo, ProviderHealth, estimate_tokens,
};

use crate::breaker::{BreakerRegistry, CircuitBreaker, ProviderState};
use crate::config::RouterConfig;
use crate::error::{
    AttemptOutcome, CandidateAttempt, FailureReason, Result, RoutingError, SkipReason,
};
use crate::ledger::{BudgetCheck, CostLedger, LedgerCharge};
use crate::profile::AgentEmbeddingProfile;
use crate::queue::{DeferredQueue, QueueTicket, QueuedRequest};
use crate::rate_limit::RateLimiter;
use crate::registry::ProviderRegistry;
use crate::request::{GenerateRequest, GenerateResponse};

/// Result of a routing attempt that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// A provider produced the embedding and it was stored.
    Embedded(EmbeddingRecord),
    /// Every candidate was exhausted and the request was parked.
    Queued(QueueTicket),
}

impl RouteOutcome {
    pub fn record(&self) -> Option<&EmbeddingRecord> {
        match self {
            RouteOutcome::Embedded(record) => Some(record),
            RouteOutcome::Queued(_) => None,
        }
    }

    pub fn response(&self) -> Option<GenerateResponse> {
        self.record().map(GenerateResponse::from)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, RouteOutcome::Queued(_))
    }
}

enum CandidateResult {
    Embedded(Box<EmbeddingRecord>),
    Attempted(CandidateAttempt),
}

/// Routes embedding requests across providers.
///
/// For each request the router walks the agent's candidate models in
/// configured order, skipping any whose breaker is open, whose projected
/// cost breaks the monthly cap, or whose observed health misses the agent's
/// constraints. The first provider to answer wins; its vector is normalized
/// to the standard dimension and stored.
///
/// A repeated request (same tenant, context, agent, task type and text)
/// within the cache TTL is answered from the embedding cache without a
/// provider call.
pub struct ModelRouter {
    config: RouterConfig,
    registry: ProviderRegistry,
    breakers: BreakerRegistry,
    ledger: Arc<CostLedger>,
    limiter: RateLimiter,
    normalizer: DimensionNormalizer,
    store: Arc<dyn EmbeddingStore>,
    cache: Arc<EmbeddingCache>,
    queue: Option<Arc<dyn DeferredQueue>>,
}

impl ModelRouter {
    pub fn builder() -> ModelRouterBuilder {
        ModelRouterBuilder::new()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn EmbeddingStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// The breaker for `provider`, created closed on first use.
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(provider)
    }

    /// Breaker and health snapshot of every registered provider.
    pub fn provider_states(&self) -> Vec<ProviderState> {
        for provider in self.registry.providers() {
            self.breakers.get_or_create(provider.name());
        }
        self.breakers.states()
    }

    /// Route one request. See [`route_with_cancel`](Self::route_with_cancel).
    pub async fn route(
        &self,
        profile: &AgentEmbeddingProfile,
        request: &GenerateRequest,
    ) -> Result<RouteOutcome> {
        self.route_with_cancel(profile, request, &CancellationToken::new())
            .await
    }

    /// Route one request, aborting the in-flight provider call and any
    /// remaining backoff when `cancel` fires.
    pub async fn route_with_cancel(
        &self,
        profile: &AgentEmbeddingProfile,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<RouteOutcome> {
        if cancel.is_cancelled() {
            return Err(RoutingError::Canceled);
        }

        profile.validate()?;
        request.validate(self.config.max_text_length)?;
        if request.agent_id != profile.agent_id {
            return Err(RoutingError::InvalidRequest(format!(
                "request for agent {} routed with profile of {}",
                request.agent_id, profile.agent_id
            )));
        }

        let started = Instant::now();
        let key = cache_key(request);
        if let Some(record) = self.cache.get(&key).await {
            return Ok(RouteOutcome::Embedded(cached_response(record, request, started)));
        }

        let candidates = profile.candidate_models(request.task_type.as_deref())?;
        self.limiter.check_and_record(
            &profile.agent_id,
            &profile.constraints.rate_limits,
            estimate_tokens(&request.text),
        )?;

        debug!(
            "Routing request for {} across {} candidates ({})",
            profile.agent_id,
            candidates.len(),
            profile.strategy.as_str()
        );

        let fallback = &profile.fallback_behavior;
        let rounds = fallback.rounds();
        let mut attempts = Vec::new();

        for round in 1..=rounds {
            for model_id in &candidates {
                match self
                    .try_candidate(profile, request, model_id, round, started, cancel)
                    .await?
                {
                    CandidateResult::Embedded(record) => {
                        self.cache.put(key, (*record).clone()).await;
                        return Ok(RouteOutcome::Embedded(*record));
                    }
                    CandidateResult::Attempted(attempt) => {
                        debug!("{attempt}");
                        attempts.push(attempt);
                    }
                }
            }

            if round < rounds {
                let delay = fallback.backoff_delay(round);
                debug!("Round {round} exhausted, backing off {delay:?}");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RoutingError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        warn!(
            "All providers exhausted for agent {} after {rounds} rounds",
            profile.agent_id
        );

        if fallback.queue_on_failure {
            match &self.queue {
                Some(queue) => {
                    let ticket = queue
                        .enqueue(QueuedRequest {
                            ticket_id: Uuid::new_v4(),
                            request: request.clone(),
                            profile_version: profile.version,
                            attempts,
                            queued_at: Utc::now(),
                        })
                        .await?;
                    return Ok(RouteOutcome::Queued(ticket));
                }
                None => warn!("queue_on_failure set but no deferred queue is attached"),
            }
        }

        Err(RoutingError::AllProvidersExhausted { attempts })
    }

    async fn try_candidate(
        &self,
        profile: &AgentEmbeddingProfile,
        request: &GenerateRequest,
        model_id: &str,
        round: u32,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<CandidateResult> {
        let attempt = |provider: Option<&str>, outcome| {
            Ok(CandidateResult::Attempted(CandidateAttempt {
                round,
                model_id: model_id.to_string(),
                provider: provider.map(str::to_string),
                outcome,
            }))
        };
        let skip = |provider: &str, reason| attempt(Some(provider), AttemptOutcome::Skipped(reason));
        let fail = |provider: &str, reason| attempt(Some(provider), AttemptOutcome::Failed(reason));

        let Some((provider, model)) = self.registry.resolve(model_id) else {
            return attempt(None, AttemptOutcome::Skipped(SkipReason::UnknownModel));
        };
        let name = provider.name();
        let breaker = self.breakers.get_or_create(name);

        let Some(permit) = breaker.try_acquire(&profile.fallback_behavior.circuit_breaker) else {
            return skip(name, SkipReason::CircuitOpen);
        };

        let constraints = &profile.constraints;
        let estimated_usd = model.estimate_cost(&request.text);
        if let BudgetCheck::Exceeded {
            accumulated_usd,
            estimated_usd,
            cap_usd,
        } = self
            .ledger
            .check(&profile.agent_id, estimated_usd, constraints.max_cost_per_month_usd)
        {
            return skip(
                name,
                SkipReason::BudgetExceeded {
                    accumulated_usd,
                    estimated_usd,
                    cap_usd,
                },
            );
        }

        if let Some(reason) = health_skip(&breaker.health(), profile) {
            return skip(name, reason);
        }

        let timeout = self.config.provider_timeout();
        let call = provider.generate(EmbeddingRequest::new(request.text.as_str(), model_id));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Call to {name} canceled");
                return Err(RoutingError::Canceled);
            }
            result = tokio::time::timeout(timeout, call) => result,
        };

        let response = match result {
            Err(_) => {
                permit.fail();
                return fail(
                    name,
                    FailureReason::Timeout {
                        after_ms: self.config.provider_timeout_ms,
                    },
                );
            }
            Ok(Err(err)) => {
                permit.fail();
                return fail(name, FailureReason::ProviderError(err.to_string()));
            }
            Ok(Ok(response)) => response,
        };
        if let Err(err) = response.validate() {
            permit.fail();
            return fail(name, FailureReason::InvalidResponse(err.to_string()));
        }
        permit.succeed();

        let record = self
            .finish(profile, request, name, model, response, started)
            .await?;
        Ok(CandidateResult::Embedded(Box::new(record)))
    }

    async fn finish(
        &self,
        profile: &AgentEmbeddingProfile,
        request: &GenerateRequest,
        provider: &str,
        model: &ModelInfo,
        response: EmbeddingResponse,
        started: Instant,
    ) -> Result<EmbeddingRecord> {
        let embedding_id = Uuid::new_v4();
        self.ledger.commit(
            &profile.agent_id,
            &LedgerCharge {
                embedding_id,
                provider,
                model_id: &model.id,
                cost_usd: response.cost_usd,
            },
        );

        let vector = self.normalizer.normalize(&response.vector)?;
        let record = EmbeddingRecord {
            embedding_id,
            agent_id: request.agent_id.clone(),
            tenant_id: request.tenant_id,
            context_id: request.context_id,
            model_id: model.id.clone(),
            provider: provider.to_string(),
            raw_dimensions: response.dimensions,
            normalized_dimensions: vector.len(),
            vector,
            cost_usd: response.cost_usd,
            generation_time_ms: elapsed_ms(started),
            provider_latency_ms: response.latency_ms,
            cached: false,
            created_at: Utc::now(),
            metadata: request.metadata.clone(),
        };

        self.store.put(record.clone()).await?;
        info!(
            "Generated embedding {} with {} via {provider} ({} → {} dims, ${:.6}, provider {}ms of {}ms)",
            record.embedding_id,
            record.model_id,
            record.raw_dimensions,
            record.normalized_dimensions,
            record.cost_usd,
            record.provider_latency_ms,
            record.generation_time_ms
        );
        Ok(record)
    }

    /// Poll every provider's health once, bounded by the provider timeout.
    /// A poll that times out records the provider as unavailable.
    pub async fn refresh_health(&self) {
        let timeout = self.config.provider_timeout();
        for provider in self.registry.providers() {
            let health = match tokio::time::timeout(timeout, provider.health()).await {
                Ok(health) => health,
                Err(_) => {
                    warn!("Health check for {} timed out", provider.name());
                    ProviderHealth::unavailable()
                }
            };
            debug!(
                "Health of {}: {:?}, p99 {}ms, availability {:.3}",
                provider.name(),
                health.status,
                health.observed_p99_latency_ms,
                health.observed_availability
            );
            self.breakers
                .get_or_create(provider.name())
                .record_health(health);
        }
    }

    /// Refresh health every `health_check_interval_secs` until `cancel` fires.
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let period = router.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => router.refresh_health().await,
                }
            }
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn cache_key(request: &GenerateRequest) -> CacheKey {
    let scope = format!(
        "{}:{}",
        request.agent_id,
        request.task_type.as_deref().unwrap_or_default()
    );
    CacheKey::new(
        request.tenant_id,
        request.context_id,
        scope,
        request.text.as_str(),
    )
}

/// A cache hit costs nothing and points at the record already stored.
fn cached_response(
    mut record: EmbeddingRecord,
    request: &GenerateRequest,
    started: Instant,
) -> EmbeddingRecord {
    record.cost_usd = 0.0;
    record.provider_latency_ms = 0;
    record.generation_time_ms = elapsed_ms(started);
    record.cached = true;
    record.metadata = request.metadata.clone();
    record
}

fn health_skip(health: &ProviderHealth, profile: &AgentEmbeddingProfile) -> Option<SkipReason> {
    if health.status == HealthStatus::Unavailable {
        return Some(SkipReason::ProviderUnavailable);
    }

    let constraints = &profile.constraints;
    if let Some(limit_ms) = constraints
        .max_latency_p99_ms
        .filter(|limit| health.observed_p99_latency_ms > *limit)
    {
        return Some(SkipReason::LatencyAboveLimit {
            observed_p99_ms: health.observed_p99_latency_ms,
            limit_ms,
        });
    }
    if let Some(required) = constraints
        .min_availability_sla
        .filter(|sla| health.observed_availability < *sla)
    {
        return Some(SkipReason::AvailabilityBelowSla {
            observed: health.observed_availability,
            required,
        });
    }
    None
}

/// Builder for [`ModelRouter`].
pub struct ModelRouterBuilder {
    config: RouterConfig,
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<dyn EmbeddingStore>>,
    cache: Option<Arc<EmbeddingCache>>,
    queue: Option<Arc<dyn DeferredQueue>>,
    ledger: Option<Arc<CostLedger>>,
}

impl ModelRouterBuilder {
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
            providers: Vec::new(),
            store: None,
            cache: None,
            queue: None,
            ledger: None,
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Defaults to an in-memory store of the standard dimension.
    pub fn with_store(mut self, store: Arc<dyn EmbeddingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to a cache sized by `cache_max_entries` and `cache_ttl_secs`.
    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn DeferredQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Share a ledger between routers.
    pub fn with_ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_provider_timeout(timeout);
        self
    }

    pub fn build(self) -> Result<ModelRouter> {
        self.config.validate()?;

        let mut registry = ProviderRegistry::new();
        for provider in self.providers {
            registry.register(provider)?;
        }

        let normalizer = DimensionNormalizer::new(self.config.standard_dimension)?;
        let store = self.store.unwrap_or_else(|| {
            Arc::new(InMemoryEmbeddingStore::new(self.config.standard_dimension))
        });
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(EmbeddingCache::with_ttl(
                self.config.cache_max_entries,
                self.config.cache_ttl(),
            ))
        });

        info!(
            "Model router ready with {} providers, standard dimension {}",
            registry.providers().len(),
            self.config.standard_dimension
        );

        Ok(ModelRouter {
            config: self.config,
            registry,
            breakers: BreakerRegistry::new(),
            ledger: self.ledger.unwrap_or_default(),
            limiter: RateLimiter::new(),
            normalizer,
            store,
            cache,
            queue: self.queue,
        })
    }
}

impl Default for ModelRouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
