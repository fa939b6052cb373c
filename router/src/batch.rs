//! Batch fan-out over the router.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, RoutingError};
use crate::profile::AgentEmbeddingProfile;
use crate::request::GenerateRequest;
use crate::router::{ModelRouter, RouteOutcome};

/// Runs many requests through one router under a concurrency cap.
///
/// `results[i]` always belongs to `requests[i]`. A failing item only fills
/// its own slot.
pub struct BatchCoordinator {
    router: Arc<ModelRouter>,
    concurrency: usize,
    max_batch_size: usize,
}

impl BatchCoordinator {
    /// Limits come from the router's configuration.
    pub fn new(router: Arc<ModelRouter>) -> Self {
        let concurrency = router.config().batch_concurrency;
        let max_batch_size = router.config().max_batch_size;
        Self {
            router,
            concurrency,
            max_batch_size,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run_batch(
        &self,
        profile: &AgentEmbeddingProfile,
        requests: &[GenerateRequest],
    ) -> Result<Vec<Result<RouteOutcome>>> {
        self.run_batch_with_cancel(profile, requests, &CancellationToken::new())
            .await
    }

    /// Route every request. Fails as a whole only when the batch cannot start:
    /// too many requests or an invalid profile.
    ///
    /// On cancellation, finished slots keep their results; waiting and
    /// in-flight slots become [`RoutingError::Canceled`].
    pub async fn run_batch_with_cancel(
        &self,
        profile: &AgentEmbeddingProfile,
        requests: &[GenerateRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<Result<RouteOutcome>>> {
        if requests.len() > self.max_batch_size {
            return Err(RoutingError::BatchTooLarge {
                size: requests.len(),
                max: self.max_batch_size,
            });
        }
        profile.validate()?;

        info!(
            "Running batch of {} requests for {} ({} at a time)",
            requests.len(),
            profile.agent_id,
            self.concurrency
        );

        let semaphore = Semaphore::new(self.concurrency);
        let items = requests.iter().enumerate().map(|(index, request)| {
            let semaphore = &semaphore;
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RoutingError::Canceled),
                    permit = semaphore.acquire() => {
                        permit.map_err(|_| RoutingError::Canceled)?
                    }
                };
                debug!("Batch item {index} started");
                self.router
                    .route_with_cancel(profile, request, cancel)
                    .await
            }
        });

        let results = join_all(items).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            "Batch finished: {} succeeded, {failed} failed",
            results.len() - failed
        );
        Ok(results)
    }
}
