//! Deferred-retry queue boundary.
//!
//! Requests that exhaust every candidate can be parked here when the
//! agent's profile asks for it. Draining and replaying is the consumer's job.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{CandidateAttempt, Result, RoutingError};
use crate::request::GenerateRequest;

/// A request parked after exhausting its candidates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedRequest {
    pub ticket_id: Uuid,
    pub request: GenerateRequest,
    /// Profile version the request was routed under.
    pub profile_version: u64,
    /// Skip and failure trail of the exhausted attempt.
    pub attempts: Vec<CandidateAttempt>,
    pub queued_at: DateTime<Utc>,
}

/// Receipt for a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueTicket {
    pub ticket_id: Uuid,
    /// Items ahead of this one when it was queued.
    pub position: usize,
}

#[async_trait]
pub trait DeferredQueue: Send + Sync {
    async fn enqueue(&self, item: QueuedRequest) -> Result<QueueTicket>;
}

/// Bounded in-process FIFO.
#[derive(Debug)]
pub struct InMemoryDeferredQueue {
    items: Mutex<VecDeque<QueuedRequest>>,
    capacity: usize,
}

impl InMemoryDeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Take every queued item, oldest first.
    pub async fn drain(&self) -> Vec<QueuedRequest> {
        self.items.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[async_trait]
impl DeferredQueue for InMemoryDeferredQueue {
    async fn enqueue(&self, item: QueuedRequest) -> Result<QueueTicket> {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            return Err(RoutingError::Queue(format!(
                "queue full ({} items)",
                self.capacity
            )));
        }

        let ticket = QueueTicket {
            ticket_id: item.ticket_id,
            position: items.len(),
        };
        info!(
            "Queued request {} for agent {}",
            item.ticket_id, item.request.agent_id
        );
        items.push_back(item);
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(text: &str) -> QueuedRequest {
        QueuedRequest {
            ticket_id: Uuid::new_v4(),
            request: GenerateRequest::new("agent", text, Uuid::nil()),
            profile_version: 1,
            attempts: Vec::new(),
            queued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fifo_and_capacity() {
        let queue = InMemoryDeferredQueue::new(2);
        let first = queue.enqueue(item("a")).await.unwrap();
        let second = queue.enqueue(item("b")).await.unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);
        assert!(matches!(
            queue.enqueue(item("c")).await,
            Err(RoutingError::Queue(_))
        ));

        let drained: Vec<String> = queue
            .drain()
            .await
            .into_iter()
            .map(|q| q.request.text)
            .collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(queue.is_empty().await);
    }
}
