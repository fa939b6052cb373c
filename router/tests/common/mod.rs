//! Scripted providers and fixtures shared by the router suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use embedmesh_embeddings::{
    EmbeddingError, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, ModelInfo,
    ProviderHealth,
};
use embedmesh_router::{
    AgentEmbeddingProfile, FallbackBehavior, GenerateRequest, ModelPreference, ModelRouter,
    Strategy,
};

/// Text of 400 bytes: 100 estimated tokens.
pub fn text() -> String {
    "quantum computing ".repeat(23).chars().take(400).collect()
}

/// A provider serving one model, named after it, with scripted behavior.
pub struct ScriptedProvider {
    model: ModelInfo,
    cost_usd: f64,
    delay: Mutex<Duration>,
    failing: AtomicBool,
    fail_next: AtomicU32,
    misreport_dimensions: AtomicBool,
    zero_vector: AtomicBool,
    health: Mutex<ProviderHealth>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(model_id: &str, dimensions: usize) -> Self {
        Self {
            model: ModelInfo::new(model_id, dimensions, 20.0),
            cost_usd: 0.001,
            delay: Mutex::new(Duration::ZERO),
            failing: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            misreport_dimensions: AtomicBool::new(false),
            zero_vector: AtomicBool::new(false),
            health: Mutex::new(ProviderHealth::healthy()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Price used for the router's cost estimate.
    pub fn with_price_per_1m(mut self, cost_per_1m_tokens: f64) -> Self {
        self.model.cost_per_1m_tokens = cost_per_1m_tokens;
        self
    }

    /// Actual cost reported per call.
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next(&self, calls: u32) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn set_misreport_dimensions(&self, misreport: bool) {
        self.misreport_dimensions.store(misreport, Ordering::SeqCst);
    }

    pub fn set_zero_vector(&self, zero: bool) {
        self.zero_vector.store(zero, Ordering::SeqCst);
    }

    pub fn set_health(&self, health: ProviderHealth) {
        *self.health.lock().unwrap() = health;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.model.id
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![self.model.clone()]
    }

    async fn generate(&self, request: EmbeddingRequest) -> embedmesh_embeddings::Result<EmbeddingResponse> {
        assert_eq!(request.model, self.model.id);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail() {
            return Err(EmbeddingError::Unavailable(format!(
                "{} is down",
                self.model.id
            )));
        }

        let dimensions = self.model.dimensions;
        let vector = if self.zero_vector.load(Ordering::SeqCst) {
            vec![0.0; dimensions]
        } else {
            (0..dimensions).map(|i| 1.0 + (i % 5) as f32).collect()
        };
        let reported = if self.misreport_dimensions.load(Ordering::SeqCst) {
            dimensions + 1
        } else {
            dimensions
        };

        Ok(EmbeddingResponse {
            vector,
            dimensions: reported,
            cost_usd: self.cost_usd,
            latency_ms: u64::try_from(delay.as_millis()).unwrap(),
        })
    }

    async fn health(&self) -> ProviderHealth {
        *self.health.lock().unwrap()
    }
}

pub fn router(providers: &[&Arc<ScriptedProvider>]) -> ModelRouter {
    providers
        .iter()
        .fold(ModelRouter::builder(), |builder, provider| {
            builder.with_provider(Arc::clone(*provider) as Arc<dyn EmbeddingProvider>)
        })
        .build()
        .unwrap()
}

/// A quality profile for `agent` whose `general_qa` preference lists
/// `primary` then `fallback`. One round, no backoff.
pub fn profile(agent: &str, primary: &[&str], fallback: &[&str]) -> AgentEmbeddingProfile {
    AgentEmbeddingProfile::new(agent, Strategy::Quality)
        .with_preference(ModelPreference::new("general_qa", primary).with_fallbacks(fallback))
        .with_fallback(FallbackBehavior {
            max_retries: 1,
            ..FallbackBehavior::default()
        })
}

pub fn request(agent: &str) -> GenerateRequest {
    GenerateRequest::new(agent, text(), Uuid::new_v4()).with_task_type("general_qa")
}
