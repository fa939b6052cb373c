//! Per-provider circuit breakers.
//!
//! A breaker moves `closed → open → half_open → closed`, or back to `open`
//! on a failed probe. Every transition happens under the breaker's own lock
//! and bumps a generation counter; outcomes reported against an older
//! generation are ignored, so concurrent reporters never repeat a transition
//! another reporter already applied.
//!
//! Callers obtain a [`BreakerPermit`] before calling a provider and settle it
//! with [`BreakerPermit::succeed`] or [`BreakerPermit::fail`]. Dropping an
//! unsettled permit (cancellation) frees its probe slot without counting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use embedmesh_embeddings::{HealthStatus, ProviderHealth};

use crate::profile::CircuitBreakerSettings;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of a provider's breaker and last health report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderState {
    pub provider: String,
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<Instant>,
    pub half_open_in_flight: u32,
    pub health_status: HealthStatus,
    pub observed_p99_latency_ms: u64,
    pub observed_availability: f64,
    /// Number of times the breaker has opened.
    pub trips: u64,
}

#[derive(Debug)]
struct BreakerInner {
    status: BreakerStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    generation: u64,
    trips: u64,
    health: ProviderHealth,
}

impl BreakerInner {
    fn transition(&mut self, status: BreakerStatus) {
        self.status = status;
        self.generation += 1;
        self.half_open_in_flight = 0;
    }

    fn trip(&mut self, provider: &str) {
        self.transition(BreakerStatus::Open);
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        self.trips += 1;
        warn!(
            "Circuit breaker for {provider} opened after {} consecutive failures",
            self.consecutive_failures
        );
    }

    fn release_probe(&mut self, generation: u64, probe: bool) {
        if probe && generation == self.generation && self.status == BreakerStatus::HalfOpen {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Circuit breaker for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            inner: Mutex::new(BreakerInner {
                status: BreakerStatus::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                half_open_in_flight: 0,
                generation: 0,
                trips: 0,
                health: ProviderHealth::default(),
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to call the provider.
    ///
    /// Returns `None` while open, and while half-open with every probe slot
    /// taken. An open breaker whose timeout has elapsed moves to half-open
    /// here and the caller becomes its first probe.
    pub fn try_acquire(self: &Arc<Self>, settings: &CircuitBreakerSettings) -> Option<BreakerPermit> {
        let mut inner = self.lock();

        if inner.status == BreakerStatus::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed());
            match elapsed {
                Some(elapsed) if elapsed >= settings.timeout() => {
                    inner.transition(BreakerStatus::HalfOpen);
                    inner.consecutive_successes = 0;
                    info!("Circuit breaker for {} half-open", self.provider);
                }
                _ => return None,
            }
        }

        let probe = inner.status == BreakerStatus::HalfOpen;
        if probe {
            if inner.half_open_in_flight >= settings.half_open_max_requests {
                debug!("No probe slot left for {}", self.provider);
                return None;
            }
            inner.half_open_in_flight += 1;
        }

        Some(BreakerPermit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            probe,
            settings: *settings,
            settled: false,
        })
    }

    /// Current state without evaluating the open timeout.
    pub fn status(&self) -> BreakerStatus {
        self.lock().status
    }

    /// Record a success outside of a permit.
    pub fn record_success(&self, settings: &CircuitBreakerSettings) {
        let generation = self.lock().generation;
        self.on_success(generation, false, settings);
    }

    /// Record a failure outside of a permit.
    pub fn record_failure(&self, settings: &CircuitBreakerSettings) {
        let generation = self.lock().generation;
        self.on_failure(generation, false, settings);
    }

    /// Store the provider's latest health report.
    pub fn record_health(&self, health: ProviderHealth) {
        self.lock().health = health;
    }

    pub fn health(&self) -> ProviderHealth {
        self.lock().health
    }

    pub fn state(&self) -> ProviderState {
        let inner = self.lock();
        ProviderState {
            provider: self.provider.clone(),
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at: inner.opened_at,
            half_open_in_flight: inner.half_open_in_flight,
            health_status: inner.health.status,
            observed_p99_latency_ms: inner.health.observed_p99_latency_ms,
            observed_availability: inner.health.observed_availability,
            trips: inner.trips,
        }
    }

    fn on_success(&self, generation: u64, probe: bool, settings: &CircuitBreakerSettings) {
        let mut inner = self.lock();
        inner.release_probe(generation, probe);
        if generation != inner.generation {
            debug!("Ignoring stale success for {}", self.provider);
            return;
        }

        match inner.status {
            BreakerStatus::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
            }
            BreakerStatus::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= settings.success_threshold {
                    inner.transition(BreakerStatus::Closed);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    info!("Circuit breaker for {} closed", self.provider);
                }
            }
            BreakerStatus::Open => {}
        }
    }

    fn on_failure(&self, generation: u64, probe: bool, settings: &CircuitBreakerSettings) {
        let mut inner = self.lock();
        inner.release_probe(generation, probe);
        if generation != inner.generation {
            debug!("Ignoring stale failure for {}", self.provider);
            return;
        }

        match inner.status {
            BreakerStatus::Closed => {
                inner.consecutive_successes = 0;
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= settings.failure_threshold {
                    inner.trip(&self.provider);
                }
            }
            BreakerStatus::HalfOpen => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.trip(&self.provider);
            }
            BreakerStatus::Open => {}
        }
    }

    fn release(&self, generation: u64, probe: bool) {
        self.lock().release_probe(generation, probe);
    }
}

/// Permission to call a provider, tied to the breaker generation it was
/// granted in.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    settings: CircuitBreakerSettings,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker
            .on_success(self.generation, self.probe, &self.settings);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker
            .on_failure(self.generation, self.probe, &self.settings);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation, self.probe);
        }
    }
}

/// Breakers keyed by provider name. Each breaker locks independently.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The breaker for `provider`, created closed on first use.
    pub fn get_or_create(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(provider) {
            return Arc::clone(breaker.value());
        }
        let entry = self
            .breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider)));
        Arc::clone(entry.value())
    }

    pub fn get(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(provider)
            .map(|breaker| Arc::clone(breaker.value()))
    }

    /// Snapshot of every breaker, sorted by provider name.
    pub fn states(&self) -> Vec<ProviderState> {
        let mut states: Vec<ProviderState> = self
            .breakers
            .iter()
            .map(|entry| entry.value().state())
            .collect();
        states.sort_by(|a, b| a.provider.cmp(&b.provider));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn settings() -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_seconds: 30,
            half_open_max_requests: 2,
        }
    }

    fn fail_times(breaker: &Arc<CircuitBreaker>, n: u32) {
        for _ in 0..n {
            breaker.try_acquire(&settings()).unwrap().fail();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_threshold_failures() {
        let breaker = Arc::new(CircuitBreaker::new("p"));

        fail_times(&breaker, 2);
        assert_eq!(breaker.status(), BreakerStatus::Closed);

        fail_times(&breaker, 1);
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert!(breaker.try_acquire(&settings()).is_none());
        assert_eq!(breaker.state().trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let breaker = Arc::new(CircuitBreaker::new("p"));

        fail_times(&breaker, 2);
        breaker.try_acquire(&settings()).unwrap().succeed();
        assert_eq!(breaker.state().consecutive_failures, 0);

        fail_times(&breaker, 2);
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_half_open() {
        let breaker = Arc::new(CircuitBreaker::new("p"));
        fail_times(&breaker, 3);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire(&settings()).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = breaker.try_acquire(&settings()).unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);

        probe.succeed();
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);
        breaker.try_acquire(&settings()).unwrap().succeed();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        assert_eq!(breaker.state().opened_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = Arc::new(CircuitBreaker::new("p"));
        fail_times(&breaker, 3);
        tokio::time::advance(Duration::from_secs(30)).await;

        breaker.try_acquire(&settings()).unwrap().succeed();
        breaker.try_acquire(&settings()).unwrap().fail();

        let state = breaker.state();
        assert_eq!(state.status, BreakerStatus::Open);
        assert_eq!(state.consecutive_successes, 0);
        assert_eq!(state.trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_slots_are_bounded() {
        let breaker = Arc::new(CircuitBreaker::new("p"));
        fail_times(&breaker, 3);
        tokio::time::advance(Duration::from_secs(30)).await;

        let first = breaker.try_acquire(&settings()).unwrap();
        let second = breaker.try_acquire(&settings()).unwrap();
        assert!(breaker.try_acquire(&settings()).is_none());

        // A canceled probe frees its slot without counting.
        drop(first);
        assert_eq!(breaker.state().consecutive_failures, 3);
        let third = breaker.try_acquire(&settings()).unwrap();

        second.succeed();
        third.succeed();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_outcomes_are_ignored() {
        let breaker = Arc::new(CircuitBreaker::new("p"));

        // Admitted while closed, reported after the breaker opened.
        let late = breaker.try_acquire(&settings()).unwrap();
        fail_times(&breaker, 3);
        late.fail();
        assert_eq!(breaker.state().trips, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = breaker.try_acquire(&settings()).unwrap();
        let sibling = breaker.try_acquire(&settings()).unwrap();
        probe.fail();
        // Already reopened by the first probe.
        sibling.fail();
        assert_eq!(breaker.state().trips, 2);
    }

    #[test]
    fn test_registry_shares_breakers() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("a");
        let again = registry.get_or_create("a");
        assert!(Arc::ptr_eq(&a, &again));

        registry.get_or_create("b");
        let providers: Vec<String> = registry.states().into_iter().map(|s| s.provider).collect();
        assert_eq!(providers, vec!["a", "b"]);
        assert!(registry.get("c").is_none());
    }
}
