//! Per-agent rate limiting with fixed windows.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, RoutingError};
use crate::profile::RateLimits;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u64,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self { started: now, used: 0 }
    }

    fn refresh(&mut self, now: Instant, length: Duration) {
        if now.duration_since(self.started) >= length {
            *self = Self::new(now);
        }
    }

    fn retry_after(&self, now: Instant, length: Duration) -> u64 {
        let remaining = length.saturating_sub(now.duration_since(self.started));
        remaining.as_secs().max(1)
    }
}

#[derive(Debug)]
struct AgentWindows {
    requests: Window,
    tokens: Window,
}

/// Requests-per-minute and tokens-per-hour limits, tracked per agent.
#[derive(Debug, Default)]
pub struct RateLimiter {
    agents: DashMap<String, AgentWindows>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request of `tokens` estimated tokens, or reject it when
    /// either window is full. Rejected requests are not counted.
    pub fn check_and_record(&self, agent_id: &str, limits: &RateLimits, tokens: u64) -> Result<()> {
        if limits.requests_per_minute == 0 && limits.tokens_per_hour == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut windows = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentWindows {
                requests: Window::new(now),
                tokens: Window::new(now),
            });
        windows.requests.refresh(now, MINUTE);
        windows.tokens.refresh(now, HOUR);

        if limits.requests_per_minute > 0
            && windows.requests.used >= u64::from(limits.requests_per_minute)
        {
            debug!("Agent {agent_id} hit {} requests per minute", limits.requests_per_minute);
            return Err(RoutingError::RateLimited {
                agent_id: agent_id.to_string(),
                retry_after_secs: windows.requests.retry_after(now, MINUTE),
            });
        }
        if limits.tokens_per_hour > 0
            && windows.tokens.used.saturating_add(tokens) > limits.tokens_per_hour
        {
            debug!("Agent {agent_id} hit {} tokens per hour", limits.tokens_per_hour);
            return Err(RoutingError::RateLimited {
                agent_id: agent_id.to_string(),
                retry_after_secs: windows.tokens.retry_after(now, HOUR),
            });
        }

        windows.requests.used += 1;
        windows.tokens.used = windows.tokens.used.saturating_add(tokens);
        Ok(())
    }
}
