//! The `embedmesh.toml` file: router settings, provider endpoints and
//! agent profiles.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use embedmesh_embeddings::{EmbeddingProvider, ModelInfo, OpenAiCompatibleProvider};
use embedmesh_router::{
    AgentEmbeddingProfile, CachedProfileStore, InMemoryProfileStore, ModelRouter, RouterConfig,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub profiles: Vec<AgentEmbeddingProfile>,
}

/// An OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    pub models: Vec<ModelInfo>,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl ProviderConfig {
    pub fn build(&self) -> OpenAiCompatibleProvider {
        let mut provider = OpenAiCompatibleProvider::new(&self.name);
        if let Some(base_url) = &self.base_url {
            provider = provider.with_base_url(base_url);
        }
        match std::env::var(&self.api_key_env) {
            Ok(key) => provider = provider.with_api_key(key),
            Err(_) => warn!(
                "{} is not set; provider {} may be unavailable",
                self.api_key_env, self.name
            ),
        }
        for model in &self.models {
            provider = provider.with_model(model.clone());
        }
        provider
    }
}

impl CliConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        self.router.validate()?;
        let mut agents = HashSet::new();
        for profile in &self.profiles {
            profile
                .validate()
                .with_context(|| format!("profile {}", profile.agent_id))?;
            if !agents.insert(profile.agent_id.as_str()) {
                bail!("profile {} is defined more than once", profile.agent_id);
            }
        }
        for provider in &self.providers {
            if provider.models.is_empty() {
                bail!("provider {} serves no models", provider.name);
            }
        }
        Ok(())
    }

    /// Load every configured profile into a cached store.
    pub async fn profile_store(&self) -> Result<CachedProfileStore<InMemoryProfileStore>> {
        let store = InMemoryProfileStore::new();
        for profile in &self.profiles {
            store.upsert(profile.clone()).await?;
        }
        Ok(CachedProfileStore::new(store))
    }

    /// Model ids referenced by profiles but served by no provider.
    pub fn unserved_models(&self) -> Vec<String> {
        let served: Vec<&str> = self
            .providers
            .iter()
            .flat_map(|p| p.models.iter().map(|m| m.id.as_str()))
            .collect();

        let mut missing: Vec<String> = self
            .profiles
            .iter()
            .flat_map(|p| &p.model_preferences)
            .flat_map(|pref| pref.primary_models.iter().chain(&pref.fallback_models))
            .filter(|model| !served.contains(&model.as_str()))
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub fn build_router(&self) -> Result<ModelRouter> {
        let builder = self.providers.iter().fold(
            ModelRouter::builder().with_config(self.router.clone()),
            |builder, provider| {
                builder.with_provider(Arc::new(provider.build()) as Arc<dyn EmbeddingProvider>)
            },
        );
        Ok(builder.build()?)
    }
}
