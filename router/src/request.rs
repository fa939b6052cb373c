//! Caller-facing request and response shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use embedmesh_embeddings::EmbeddingRecord;

use crate::error::{Result, RoutingError};
use crate::profile::MAX_AGENT_ID_LENGTH;

/// Metadata key fragments that must never reach storage.
const SENSITIVE_METADATA_KEYS: [&str; 5] = ["password", "secret", "token", "apikey", "api_key"];

/// Request to generate one embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub agent_id: String,

    pub text: String,

    /// Selects the profile's model preference. When absent, the profile's
    /// strategy orders every preference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,

    pub tenant_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl GenerateRequest {
    pub fn new(agent_id: impl Into<String>, text: impl Into<String>, tenant_id: Uuid) -> Self {
        Self {
            agent_id: agent_id.into(),
            text: text.into(),
            task_type: None,
            tenant_id,
            context_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_context(mut self, context_id: Uuid) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Reject requests that must not be routed.
    pub fn validate(&self, max_text_length: usize) -> Result<()> {
        if self.agent_id.is_empty() {
            return Err(invalid("agent_id is required"));
        }
        if self.agent_id.len() > MAX_AGENT_ID_LENGTH {
            return Err(invalid("agent_id too long"));
        }
        if self.text.is_empty() {
            return Err(invalid("text is required"));
        }
        if self.text.len() > max_text_length {
            return Err(RoutingError::InvalidRequest(format!(
                "text exceeds {max_text_length} bytes"
            )));
        }

        for key in self.metadata.keys() {
            let lower = key.to_lowercase();
            if SENSITIVE_METADATA_KEYS
                .iter()
                .any(|sensitive| lower.contains(sensitive))
            {
                return Err(RoutingError::InvalidRequest(format!(
                    "metadata key {key} looks sensitive"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> RoutingError {
    RoutingError::InvalidRequest(message.to_string())
}

/// Result of one successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub embedding_id: Uuid,
    pub model_used: String,
    pub provider: String,
    /// Raw model dimension.
    pub dimensions: usize,
    pub normalized_dimensions: usize,
    pub cost_usd: f64,
    pub generation_time_ms: u64,
    pub provider_latency_ms: u64,
    /// Served from the embedding cache.
    pub cached: bool,
}

impl From<&EmbeddingRecord> for GenerateResponse {
    fn from(record: &EmbeddingRecord) -> Self {
        Self {
            embedding_id: record.embedding_id,
            model_used: record.model_id.clone(),
            provider: record.provider.clone(),
            dimensions: record.raw_dimensions,
            normalized_dimensions: record.normalized_dimensions,
            cost_usd: record.cost_usd,
            generation_time_ms: record.generation_time_ms,
            provider_latency_ms: record.provider_latency_ms,
            cached: record.cached,
        }
    }
}
