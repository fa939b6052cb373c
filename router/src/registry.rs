//! Model id to provider lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use embedmesh_embeddings::{EmbeddingProvider, ModelInfo};

use crate::error::{Result, RoutingError};

#[derive(Clone)]
struct RegisteredModel {
    provider: Arc<dyn EmbeddingProvider>,
    info: ModelInfo,
}

/// Providers and the models they serve.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    models: HashMap<String, RegisteredModel>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider and every model it serves. A model id may be
    /// served by one provider only.
    pub fn register(&mut self, provider: Arc<dyn EmbeddingProvider>) -> Result<()> {
        if self.providers.iter().any(|p| p.name() == provider.name()) {
            return Err(RoutingError::Config(format!(
                "provider {} registered twice",
                provider.name()
            )));
        }

        let models = provider.models();
        for model in &models {
            if let Some(existing) = self.models.get(&model.id) {
                return Err(RoutingError::Config(format!(
                    "model {} already served by {}",
                    model.id,
                    existing.provider.name()
                )));
            }
            if model.dimensions == 0 {
                return Err(RoutingError::Config(format!(
                    "model {} has zero dimensions",
                    model.id
                )));
            }
        }

        for model in models {
            debug!("Registered model {} on {}", model.id, provider.name());
            self.models.insert(
                model.id.clone(),
                RegisteredModel {
                    provider: Arc::clone(&provider),
                    info: model,
                },
            );
        }
        self.providers.push(provider);
        Ok(())
    }

    /// The provider serving `model_id` and the model's description.
    pub fn resolve(&self, model_id: &str) -> Option<(Arc<dyn EmbeddingProvider>, &ModelInfo)> {
        self.models
            .get(model_id)
            .map(|registered| (Arc::clone(&registered.provider), &registered.info))
    }

    pub fn providers(&self) -> &[Arc<dyn EmbeddingProvider>] {
        &self.providers
    }

    pub fn model_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.models.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
