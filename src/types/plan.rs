use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{AgentId, CoordinationId, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    Primary,
    Support,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Specialist,
    Generalist,
}

impl Tier {
    pub fn classify(capability_count: usize, specialist_min: usize) -> Self {
        if capability_count >= specialist_min {
            Tier::Specialist
        } else {
            Tier::Generalist
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationType {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    Weighted,
    #[default]
    CapabilityBased,
    FastestResponse,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::RoundRobin,
        Strategy::LeastLoaded,
        Strategy::Weighted,
        Strategy::CapabilityBased,
        Strategy::FastestResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoaded => "least_loaded",
            Strategy::Weighted => "weighted",
            Strategy::CapabilityBased => "capability_based",
            Strategy::FastestResponse => "fastest_response",
        }
    }

    /// Unknown or missing names fall back to capability-based selection.
    pub fn from_name(name: Option<&str>) -> Self {
        name.and_then(|n| {
            let n = n.trim();
            Self::ALL
                .into_iter()
                .find(|s| s.as_str().eq_ignore_ascii_case(n))
        })
        .unwrap_or_default()
    }

    pub fn default_max_agents(&self) -> usize {
        match self {
            Strategy::RoundRobin | Strategy::Weighted | Strategy::CapabilityBased => 3,
            Strategy::LeastLoaded | Strategy::FastestResponse => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl BackoffKind {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32, base: Duration) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffKind::Fixed => base,
            BackoffKind::Linear => base.saturating_mul(attempt),
            BackoffKind::Exponential => {
                base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffKind::Fixed,
            base_delay_ms: 0,
        }
    }

    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff
            .delay(attempt, Duration::from_millis(self.base_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    pub min_successful_agents: usize,
}

impl SuccessCriteria {
    pub fn is_met(&self, fulfilled: usize) -> bool {
        fulfilled >= self.min_successful_agents
    }
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            min_successful_agents: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAgent {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub tier: Tier,
    pub priority: Priority,
    /// Milliseconds, from the agent's recorded average.
    pub expected_response_time: f64,
}

/// Agent-bound execution contract for one coordination. Built once, consumed
/// once by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationPlan {
    pub id: CoordinationId,
    pub task_type: String,
    pub strategy: Strategy,
    pub agents: Vec<PlannedAgent>,
    pub coordination_type: CoordinationType,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub success_criteria: SuccessCriteria,
    pub created_at: DateTime<Utc>,
}

impl CoordinationPlan {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.agent_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentOutcome {
    Fulfilled { result: Value },
    Rejected { error: String },
}

impl AgentOutcome {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, AgentOutcome::Fulfilled { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub coordination_id: CoordinationId,
    pub task_type: String,
    pub coordination_type: CoordinationType,
    pub execution_time_ms: u64,
    pub results: BTreeMap<AgentId, AgentOutcome>,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// `success` is derived here and nowhere else.
    pub fn new(
        plan: &CoordinationPlan,
        results: BTreeMap<AgentId, AgentOutcome>,
        execution_time: Duration,
    ) -> Self {
        let fulfilled = results.values().filter(|o| o.is_fulfilled()).count();
        Self {
            coordination_id: plan.id,
            task_type: plan.task_type.clone(),
            coordination_type: plan.coordination_type,
            execution_time_ms: execution_time.as_millis() as u64,
            success: plan.success_criteria.is_met(fulfilled),
            results,
            completed_at: Utc::now(),
        }
    }

    pub fn fulfilled_count(&self) -> usize {
        self.results.values().filter(|o| o.is_fulfilled()).count()
    }

    pub fn rejected_count(&self) -> usize {
        self.results.len() - self.fulfilled_count()
    }
}
