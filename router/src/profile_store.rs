//! Profile storage.
//!
//! Profiles are handed out as `Arc`s, so a request in flight keeps the
//! version it started with even if the profile is updated or deleted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, RoutingError};
use crate::profile::AgentEmbeddingProfile;

/// Read side of profile storage, as seen by the router.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, agent_id: &str) -> Result<Arc<AgentEmbeddingProfile>>;
}

#[derive(Debug)]
struct StoredProfile {
    profile: Arc<AgentEmbeddingProfile>,
    deleted: bool,
}

/// In-memory profile store with admin writes.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, StoredProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile, returning its new version.
    pub async fn upsert(&self, mut profile: AgentEmbeddingProfile) -> Result<u64> {
        profile.validate()?;

        let mut profiles = self.profiles.write().await;
        let version = profiles
            .get(&profile.agent_id)
            .map_or(1, |stored| stored.profile.version + 1);
        profile.version = version;

        info!("Stored profile {} version {version}", profile.agent_id);
        profiles.insert(
            profile.agent_id.clone(),
            StoredProfile {
                profile: Arc::new(profile),
                deleted: false,
            },
        );
        Ok(version)
    }

    /// Hide a profile from reads. Returns `false` if it was not present.
    pub async fn soft_delete(&self, agent_id: &str) -> bool {
        let mut profiles = self.profiles.write().await;
        match profiles.get_mut(agent_id) {
            Some(stored) if !stored.deleted => {
                stored.deleted = true;
                info!("Soft-deleted profile {agent_id}");
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.profiles
            .read()
            .await
            .values()
            .filter(|stored| !stored.deleted)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self, agent_id: &str) -> Result<Arc<AgentEmbeddingProfile>> {
        self.profiles
            .read()
            .await
            .get(agent_id)
            .filter(|stored| !stored.deleted)
            .map(|stored| Arc::clone(&stored.profile))
            .ok_or_else(|| RoutingError::ProfileNotFound(agent_id.to_string()))
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Read-through cache in front of another store. Updates become visible
/// after [`invalidate`](Self::invalidate).
pub struct CachedProfileStore<S> {
    inner: S,
    cache: RwLock<HashMap<String, Arc<AgentEmbeddingProfile>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: ProfileStore> CachedProfileStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub async fn invalidate(&self, agent_id: &str) {
        if self.cache.write().await.remove(agent_id).is_some() {
            debug!("Invalidated cached profile {agent_id}");
        }
    }

    pub async fn invalidate_all(&self) {
        self.cache.write().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.read().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl<S: ProfileStore> ProfileStore for CachedProfileStore<S> {
    async fn get(&self, agent_id: &str) -> Result<Arc<AgentEmbeddingProfile>> {
        if let Some(profile) = self.cache.read().await.get(agent_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(profile));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let profile = self.inner.get(agent_id).await?;
        self.cache
            .write()
            .await
            .insert(agent_id.to_string(), Arc::clone(&profile));
        Ok(profile)
    }
}
