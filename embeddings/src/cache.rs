//! Embedding cache for repeated requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::EmbeddingRecord;

/// Entries expire after an hour unless configured otherwise.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Identifies requests that may share one generated embedding.
///
/// `scope` is chosen by the caller; the router uses the agent and task type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_id: Uuid,
    pub context_id: Option<Uuid>,
    pub scope: String,
    pub text: String,
}

impl CacheKey {
    pub fn new(
        tenant_id: Uuid,
        context_id: Option<Uuid>,
        scope: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            context_id,
            scope: scope.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: EmbeddingRecord,
    inserted_at: Instant,
}

/// Bounded in-memory cache of normalized records with a fixed time to live.
///
/// When full, the oldest entry is evicted. A capacity of zero disables the
/// cache: `put` is a no-op and every `get` misses.
#[derive(Debug)]
pub struct EmbeddingCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(max_entries: usize) -> Self {
        Self::with_ttl(max_entries, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0
    }

    /// The cached record for `key`, if present and not expired.
    pub async fn get(&self, key: &CacheKey) -> Option<EmbeddingRecord> {
        let found = {
            let entries = self.entries.read().await;
            entries
                .get(key)
                .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
                .map(|entry| entry.record.clone())
        };

        match found {
            Some(record) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {} ({})", key.scope, record.model_id);
                Some(record)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(&self, key: CacheKey, record: EmbeddingRecord) {
        if !self.is_enabled() {
            return;
        }

        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);

        let oldest = (entries.len() >= self.max_entries && !entries.contains_key(&key))
            .then(|| {
                entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(oldest, _)| oldest.clone())
            })
            .flatten();
        if let Some(oldest) = oldest {
            entries.remove(&oldest);
        }

        debug!("Cached embedding for {} ({})", key.scope, record.model_id);
        entries.insert(
            key,
            CacheEntry {
                record,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn remove(&self, key: &CacheKey) {
        self.entries.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
        info!("Cleared embedding cache");
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().await.len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the embedding cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn record(model_id: &str) -> EmbeddingRecord {
        EmbeddingRecord {
            embedding_id: Uuid::new_v4(),
            agent_id: "agent".to_string(),
            tenant_id: Uuid::nil(),
            context_id: None,
            model_id: model_id.to_string(),
            provider: "provider".to_string(),
            raw_dimensions: 2,
            normalized_dimensions: 2,
            vector: vec![0.6, 0.8],
            cost_usd: 0.001,
            generation_time_ms: 5,
            provider_latency_ms: 4,
            cached: false,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    fn key(text: &str) -> CacheKey {
        CacheKey::new(Uuid::nil(), None, "agent:general_qa", text)
    }

    #[tokio::test]
    async fn test_cache_put_get() {
        let cache = EmbeddingCache::new(100);
        let stored = record("model-1");
        cache.put(key("hello"), stored.clone()).await;

        assert_eq!(cache.get(&key("hello")).await, Some(stored));
        assert_eq!(cache.get(&key("other")).await, None);

        let stats = cache.stats().await;
        assert_eq!((stats.entries, stats.hits, stats.misses), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_key_includes_tenant_and_scope() {
        let cache = EmbeddingCache::new(100);
        cache.put(key("hello"), record("model-1")).await;

        let other_tenant = CacheKey::new(Uuid::new_v4(), None, "agent:general_qa", "hello");
        let other_scope = CacheKey::new(Uuid::nil(), None, "agent:code", "hello");
        let other_context =
            CacheKey::new(Uuid::nil(), Some(Uuid::new_v4()), "agent:general_qa", "hello");
        assert!(cache.get(&other_tenant).await.is_none());
        assert!(cache.get(&other_scope).await.is_none());
        assert!(cache.get(&other_context).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = EmbeddingCache::with_ttl(100, Duration::from_secs(60));
        cache.put(key("hello"), record("model-1")).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&key("hello")).await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&key("hello")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_eviction() {
        let cache = EmbeddingCache::new(2);
        cache.put(key("a"), record("model")).await;
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put(key("b"), record("model")).await;
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put(key("c"), record("model")).await;

        assert_eq!(cache.stats().await.entries, 2);
        assert!(cache.get(&key("a")).await.is_none());
        assert!(cache.get(&key("c")).await.is_some());
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_cache() {
        let cache = EmbeddingCache::new(0);
        cache.put(key("hello"), record("model-1")).await;
        assert!(!cache.is_enabled());
        assert!(cache.get(&key("hello")).await.is_none());
    }
}
