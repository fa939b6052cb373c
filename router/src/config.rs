//! Configuration for the routing engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use embedmesh_embeddings::STANDARD_DIMENSION;

use crate::error::{Result, RoutingError};
use crate::profile::AgentEmbeddingProfile;

/// Configuration for the routing engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Dimension every stored embedding is normalized to.
    pub standard_dimension: usize,

    /// Timeout for a single provider call (in milliseconds).
    pub provider_timeout_ms: u64,

    /// Maximum batch items routed at the same time.
    pub batch_concurrency: usize,

    /// Maximum number of requests accepted in one batch.
    pub max_batch_size: usize,

    /// Maximum request text length in bytes.
    pub max_text_length: usize,

    /// Interval between provider health polls (in seconds).
    pub health_check_interval_secs: u64,

    /// Embedding cache capacity. Zero disables caching.
    pub cache_max_entries: usize,

    /// Lifetime of a cached embedding (in seconds).
    pub cache_ttl_secs: u64,
}

impl RouterConfig {
    /// Parse a configuration from TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.standard_dimension == 0 {
            return Err(RoutingError::Config(
                "standard_dimension must be positive".to_string(),
            ));
        }
        if self.provider_timeout_ms == 0 {
            return Err(RoutingError::Config(
                "provider_timeout_ms must be positive".to_string(),
            ));
        }
        if self.batch_concurrency == 0 {
            return Err(RoutingError::Config(
                "batch_concurrency must be positive".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(RoutingError::Config(
                "max_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the provider call timeout.
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the batch concurrency limit.
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency;
        self
    }

    /// Set the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the embedding cache capacity; zero disables it.
    pub fn with_cache_capacity(mut self, max_entries: usize) -> Self {
        self.cache_max_entries = max_entries;
        self
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            standard_dimension: STANDARD_DIMENSION,
            provider_timeout_ms: 30_000,
            batch_concurrency: 10,
            max_batch_size: 1000,
            max_text_length: 1_000_000,
            health_check_interval_secs: 30,
            cache_max_entries: 10_000,
            cache_ttl_secs: 3600,
        }
    }
}

/// A file holding agent profiles as a `[[profiles]]` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: Vec<AgentEmbeddingProfile>,
}

impl ProfilesFile {
    /// Parse and validate profiles from TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: Self = toml::from_str(contents)?;
        for profile in &file.profiles {
            profile.validate()?;
        }
        Ok(file)
    }

    /// Load profiles from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Strategy;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.standard_dimension, 1536);
        assert_eq!(config.provider_timeout(), Duration::from_secs(30));
        assert_eq!(config.batch_concurrency, 10);
        assert_eq!(config.cache_max_entries, 10_000);
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RouterConfig::from_toml_str("batch_concurrency = 4\n").unwrap();
        assert_eq!(
            config,
            RouterConfig {
                batch_concurrency: 4,
                ..RouterConfig::default()
            }
        );
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(RouterConfig::from_toml_str("standard_dimension = 0").is_err());
        assert!(RouterConfig::from_toml_str("provider_timeout_ms = 0").is_err());
        assert!(RouterConfig::from_toml_str("batch_concurrency = 0").is_err());
        assert!(RouterConfig::from_toml_str("max_batch_size = 0").is_err());
    }

    #[test]
    fn test_load_profiles_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[profiles]]
agent_id = "agent-a"
strategy = "quality"

[[profiles.model_preferences]]
task_type = "code_analysis"
primary_models = ["model-large"]
fallback_models = ["model-small"]

[profiles.constraints]
max_cost_per_month_usd = 10.0

[profiles.fallback_behavior]
max_retries = 2
"#
        )
        .unwrap();

        let loaded = ProfilesFile::load(file.path()).unwrap();
        assert_eq!(loaded.profiles.len(), 1);

        let profile = &loaded.profiles[0];
        assert_eq!(profile.agent_id, "agent-a");
        assert_eq!(profile.strategy, Strategy::Quality);
        assert_eq!(profile.constraints.max_cost_per_month_usd, Some(10.0));
        assert_eq!(profile.fallback_behavior.max_retries, 2);
        assert_eq!(profile.fallback_behavior.initial_delay_ms, 100);
        assert_eq!(profile.fallback_behavior.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let result = ProfilesFile::from_toml_str(
            r#"
[[profiles]]
agent_id = ""
strategy = "cost"
"#,
        );
        assert!(matches!(result, Err(RoutingError::InvalidProfile(_))));
    }
}
