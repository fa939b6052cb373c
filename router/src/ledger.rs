//! Per-agent monthly cost ledger.
//!
//! The budget check is advisory: it reads the accumulated spend without
//! reserving anything, so concurrent requests can jointly overshoot a cap by
//! at most the sum of their in-flight estimates. Commits are idempotent per
//! embedding id and only ever increase the period's total.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// A calendar month in UTC, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    /// The month containing `now`.
    pub fn containing(now: DateTime<Utc>) -> Self {
        let first = month_start(now.date_naive());
        let next = month_start(first + Days::new(32));
        Self {
            start: first.and_time(NaiveTime::MIN).and_utc(),
            end: next.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.day0()))
}

/// Accumulated spend of one agent in one period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostLedgerEntry {
    pub agent_id: String,
    pub accumulated_usd: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Spend of one agent in the current period, broken down.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub agent_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_cost_usd: f64,
    pub by_provider: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
    pub request_count: u64,
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetCheck {
    Within,
    Exceeded {
        accumulated_usd: f64,
        estimated_usd: f64,
        cap_usd: f64,
    },
}

impl BudgetCheck {
    pub fn is_within(&self) -> bool {
        matches!(self, BudgetCheck::Within)
    }
}

/// Actual cost of one successful generation.
#[derive(Debug, Clone)]
pub struct LedgerCharge<'a> {
    pub embedding_id: Uuid,
    pub provider: &'a str,
    pub model_id: &'a str,
    pub cost_usd: f64,
}

#[derive(Debug)]
struct AgentLedger {
    period: BillingPeriod,
    accumulated_usd: f64,
    committed: HashSet<Uuid>,
    by_provider: HashMap<String, f64>,
    by_model: HashMap<String, f64>,
    request_count: u64,
}

impl AgentLedger {
    fn new(period: BillingPeriod) -> Self {
        Self {
            period,
            accumulated_usd: 0.0,
            committed: HashSet::new(),
            by_provider: HashMap::new(),
            by_model: HashMap::new(),
            request_count: 0,
        }
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        if !self.period.contains(now) {
            debug!(
                "Cost period rolled over from {} to {}",
                self.period.start,
                BillingPeriod::containing(now).start
            );
            *self = Self::new(BillingPeriod::containing(now));
        }
    }
}

/// Spend per agent. Each agent's entry locks independently.
#[derive(Debug, Default)]
pub struct CostLedger {
    agents: DashMap<String, AgentLedger>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend accumulated by `agent_id` in the current period.
    pub fn accumulated(&self, agent_id: &str) -> f64 {
        self.accumulated_at(agent_id, Utc::now())
    }

    pub fn accumulated_at(&self, agent_id: &str, now: DateTime<Utc>) -> f64 {
        self.agents
            .get(agent_id)
            .filter(|ledger| ledger.period.contains(now))
            .map_or(0.0, |ledger| ledger.accumulated_usd)
    }

    /// Whether `estimated_usd` more spend stays within `cap_usd`.
    /// No cap means always within.
    pub fn check(&self, agent_id: &str, estimated_usd: f64, cap_usd: Option<f64>) -> BudgetCheck {
        self.check_at(agent_id, estimated_usd, cap_usd, Utc::now())
    }

    pub fn check_at(
        &self,
        agent_id: &str,
        estimated_usd: f64,
        cap_usd: Option<f64>,
        now: DateTime<Utc>,
    ) -> BudgetCheck {
        let Some(cap_usd) = cap_usd else {
            return BudgetCheck::Within;
        };
        let accumulated_usd = self.accumulated_at(agent_id, now);
        if accumulated_usd + estimated_usd > cap_usd {
            BudgetCheck::Exceeded {
                accumulated_usd,
                estimated_usd,
                cap_usd,
            }
        } else {
            BudgetCheck::Within
        }
    }

    /// Add the actual cost of a generation. Returns `false` when the
    /// embedding was already committed.
    pub fn commit(&self, agent_id: &str, charge: &LedgerCharge<'_>) -> bool {
        self.commit_at(agent_id, charge, Utc::now())
    }

    pub fn commit_at(&self, agent_id: &str, charge: &LedgerCharge<'_>, now: DateTime<Utc>) -> bool {
        let cost_usd = if charge.cost_usd.is_finite() && charge.cost_usd >= 0.0 {
            charge.cost_usd
        } else {
            warn!(
                "Ignoring invalid cost {} for embedding {}",
                charge.cost_usd, charge.embedding_id
            );
            0.0
        };

        let mut ledger = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentLedger::new(BillingPeriod::containing(now)));
        ledger.roll_over(now);

        if !ledger.committed.insert(charge.embedding_id) {
            debug!("Embedding {} already committed", charge.embedding_id);
            return false;
        }

        ledger.accumulated_usd += cost_usd;
        ledger.request_count += 1;
        *ledger
            .by_provider
            .entry(charge.provider.to_string())
            .or_default() += cost_usd;
        *ledger
            .by_model
            .entry(charge.model_id.to_string())
            .or_default() += cost_usd;
        true
    }

    pub fn entry(&self, agent_id: &str) -> CostLedgerEntry {
        self.entry_at(agent_id, Utc::now())
    }

    pub fn entry_at(&self, agent_id: &str, now: DateTime<Utc>) -> CostLedgerEntry {
        let period = BillingPeriod::containing(now);
        CostLedgerEntry {
            agent_id: agent_id.to_string(),
            accumulated_usd: self.accumulated_at(agent_id, now),
            period_start: period.start,
            period_end: period.end,
        }
    }

    pub fn summary(&self, agent_id: &str) -> CostSummary {
        self.summary_at(agent_id, Utc::now())
    }

    pub fn summary_at(&self, agent_id: &str, now: DateTime<Utc>) -> CostSummary {
        let period = BillingPeriod::containing(now);
        let mut summary = CostSummary {
            agent_id: agent_id.to_string(),
            period_start: period.start,
            period_end: period.end,
            total_cost_usd: 0.0,
            by_provider: HashMap::new(),
            by_model: HashMap::new(),
            request_count: 0,
        };

        if let Some(ledger) = self
            .agents
            .get(agent_id)
            .filter(|ledger| ledger.period.contains(now))
        {
            summary.total_cost_usd = ledger.accumulated_usd;
            summary.by_provider = ledger.by_provider.clone();
            summary.by_model = ledger.by_model.clone();
            summary.request_count = ledger.request_count;
        }
        summary
    }
}
