use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::engine::balancer::{LoadBalancer, SelectionOptions};
use crate::engine::correlation::AgentCaller;
use crate::engine::registry::AgentRegistry;
use crate::error::{CoordinationError, Result};
use crate::types::{
    AgentDescriptor, AgentId, AgentOutcome, AgentReply, AgentRole, Capability, CoordinationId,
    CoordinationPlan, CoordinationType, ExecutionResult, MessageKind, PlannedAgent, Priority,
    RetryPolicy, Strategy, SuccessCriteria, TaskMessage,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationRequest {
    pub task_type: String,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub agent_ids: Option<Vec<AgentId>>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub options: CoordinationOptions,
}

impl CoordinationRequest {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            strategy: None,
            agent_ids: None,
            priority: Priority::Normal,
            options: CoordinationOptions::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_agents(mut self, agent_ids: Vec<AgentId>) -> Self {
        self.agent_ids = Some(agent_ids);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: CoordinationOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationOptions {
    pub max_agents: Option<usize>,
    pub weights: HashMap<AgentId, f64>,
    pub complex: bool,
    pub coordination_type: Option<CoordinationType>,
    pub timeout_ms: Option<u64>,
    pub min_successful_agents: Option<usize>,
    pub retry_policy: Option<RetryPolicy>,
}

impl CoordinationOptions {
    fn selection(&self) -> SelectionOptions {
        SelectionOptions {
            max_agents: self.max_agents,
            weights: self.weights.clone(),
            complex: self.complex,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub default_timeout_ms: u64,
    pub default_retry_policy: RetryPolicy,
    pub log_limit: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            default_retry_policy: RetryPolicy::default(),
            log_limit: 100,
        }
    }
}

/// Per-coordination counters. A request counts as processed once it resolves,
/// whether with a result or a structural error.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    requests_processed: AtomicU64,
    requests_successful: AtomicU64,
    requests_failed: AtomicU64,
    load_balancing_decisions: AtomicU64,
    active_coordinations: AtomicU64,
    total_execution_ms: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_processed: u64,
    pub requests_successful: u64,
    pub requests_failed: u64,
    pub load_balancing_decisions: u64,
    pub active_coordinations: u64,
    pub average_execution_ms: f64,
    /// Percentage; 100 when nothing has been processed yet.
    pub success_rate: f64,
}

impl CoordinatorMetrics {
    fn record(&self, succeeded: bool, elapsed_ms: u64) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        if succeeded {
            self.requests_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.requests_processed.load(Ordering::Relaxed);
        let successful = self.requests_successful.load(Ordering::Relaxed);
        let total_ms = self.total_execution_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests_processed: processed,
            requests_successful: successful,
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            load_balancing_decisions: self.load_balancing_decisions.load(Ordering::Relaxed),
            active_coordinations: self.active_coordinations.load(Ordering::Relaxed),
            average_execution_ms: if processed == 0 {
                0.0
            } else {
                total_ms as f64 / processed as f64
            },
            success_rate: if processed == 0 {
                100.0
            } else {
                successful as f64 / processed as f64 * 100.0
            },
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    caller: Arc<dyn AgentCaller>,
    balancer: LoadBalancer,
    settings: CoordinatorSettings,
    metrics: CoordinatorMetrics,
    log: Mutex<VecDeque<ExecutionResult>>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        caller: Arc<dyn AgentCaller>,
        balancer: LoadBalancer,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            registry,
            caller,
            balancer,
            settings,
            metrics: CoordinatorMetrics::default(),
            log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Resolves exactly once: an `ExecutionResult` (per-agent failures are
    /// recorded inside it) or a single structural error.
    pub async fn coordinate(&self, request: CoordinationRequest) -> Result<ExecutionResult> {
        let _active = ActiveGuard::enter(&self.metrics.active_coordinations);
        let started = Instant::now();

        let plan = match self.plan(&request) {
            Ok(plan) => plan,
            Err(e) => {
                log::warn!("coordination for '{}' rejected: {}", request.task_type, e);
                self.metrics
                    .record(false, started.elapsed().as_millis() as u64);
                return Err(e);
            }
        };

        log::info!(
            "coordination {} started: task '{}', {} {:?} agents [{}]",
            plan.id,
            plan.task_type,
            plan.agents.len(),
            plan.coordination_type,
            plan.agent_ids().join(", ")
        );

        let result = self.execute(plan).await;

        log::info!(
            "coordination {} finished: success={} fulfilled={}/{} in {}ms",
            result.coordination_id,
            result.success,
            result.fulfilled_count(),
            result.results.len(),
            result.execution_time_ms
        );

        self.metrics.record(result.success, result.execution_time_ms);
        self.append_log(result.clone());
        Ok(result)
    }

    /// Resolves candidates, selects a subset and builds the plan.
    pub fn plan(&self, request: &CoordinationRequest) -> Result<CoordinationPlan> {
        let task_type = Capability::new(&request.task_type)
            .map_err(|_| CoordinationError::InvalidTaskType(request.task_type.clone()))?;

        let candidates = self
            .registry
            .find_suitable(&task_type, request.agent_ids.as_deref());
        if candidates.is_empty() {
            return Err(CoordinationError::NoSuitableAgents {
                task_type: task_type.to_string(),
            });
        }

        let strategy = Strategy::from_name(request.strategy.as_deref());
        let selected = self.balancer.select(
            strategy,
            &candidates,
            request.priority,
            &request.options.selection(),
        );
        self.metrics
            .load_balancing_decisions
            .fetch_add(1, Ordering::Relaxed);

        if selected.is_empty() {
            return Err(CoordinationError::NoSuitableAgents {
                task_type: task_type.to_string(),
            });
        }

        let agents = selected
            .iter()
            .map(|agent| PlannedAgent {
                agent_id: agent.id.clone(),
                role: assign_role(agent, &task_type),
                tier: self.balancer.tier_of(agent),
                priority: request.priority,
                expected_response_time: agent.performance_metrics.response_time,
            })
            .collect();

        Ok(CoordinationPlan {
            id: CoordinationId::new_v4(),
            task_type: task_type.to_string(),
            strategy,
            agents,
            coordination_type: request.options.coordination_type.unwrap_or_default(),
            timeout_ms: request
                .options
                .timeout_ms
                .unwrap_or(self.settings.default_timeout_ms),
            retry_policy: request
                .options
                .retry_policy
                .unwrap_or(self.settings.default_retry_policy),
            success_criteria: SuccessCriteria {
                min_successful_agents: request
                    .options
                    .min_successful_agents
                    .unwrap_or_else(|| SuccessCriteria::default().min_successful_agents),
            },
            created_at: Utc::now(),
        })
    }

    pub async fn execute(&self, plan: CoordinationPlan) -> ExecutionResult {
        let started = Instant::now();
        let results = match plan.coordination_type {
            CoordinationType::Sequential => self.execute_sequential(&plan).await,
            CoordinationType::Parallel => self.execute_parallel(&plan).await,
        };
        ExecutionResult::new(&plan, results, started.elapsed())
    }

    async fn execute_sequential(&self, plan: &CoordinationPlan) -> BTreeMap<AgentId, AgentOutcome> {
        let mut results = BTreeMap::new();
        let mut fulfilled = 0;

        for (index, agent) in plan.agents.iter().enumerate() {
            let outcome = self.dispatch(plan, agent).await;
            if outcome.is_fulfilled() {
                fulfilled += 1;
            }
            results.insert(agent.agent_id.clone(), outcome);

            if plan.success_criteria.is_met(fulfilled) {
                let skipped = plan.agents.len() - index - 1;
                if skipped > 0 {
                    log::debug!(
                        "coordination {}: success criteria met, skipping {} agents",
                        plan.id,
                        skipped
                    );
                }
                break;
            }
        }

        results
    }

    async fn execute_parallel(&self, plan: &CoordinationPlan) -> BTreeMap<AgentId, AgentOutcome> {
        let calls = plan.agents.iter().map(|agent| async move {
            let outcome = self.dispatch(plan, agent).await;
            (agent.agent_id.clone(), outcome)
        });
        join_all(calls).await.into_iter().collect()
    }

    /// One agent, with the plan's retry policy. Never fails outward.
    async fn dispatch(&self, plan: &CoordinationPlan, agent: &PlannedAgent) -> AgentOutcome {
        let task = TaskMessage {
            task_type: plan.task_type.clone(),
            role: agent.role,
            priority: agent.priority,
            coordination_id: plan.id,
        };
        let payload = match serde_json::to_value(&task) {
            Ok(payload) => payload,
            Err(e) => {
                return AgentOutcome::Rejected {
                    error: e.to_string(),
                }
            }
        };

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(plan.retry_policy.delay_before(attempt)).await;
            }

            let error = match self
                .caller
                .call_agent(
                    &agent.agent_id,
                    MessageKind::CoordinationTask,
                    payload.clone(),
                    agent.priority,
                    plan.timeout(),
                )
                .await
            {
                Ok(response) => match AgentReply::from_payload(&response.payload) {
                    AgentReply::Success { result } => return AgentOutcome::Fulfilled { result },
                    AgentReply::Failure { error } => CoordinationError::AgentFailure {
                        agent_id: agent.agent_id.clone(),
                        reason: error,
                    },
                },
                Err(e) => e,
            };

            if attempt >= plan.retry_policy.max_retries {
                log::warn!(
                    "coordination {}: agent {} failed after {} attempt(s): {}",
                    plan.id,
                    agent.agent_id,
                    attempt + 1,
                    error
                );
                return AgentOutcome::Rejected {
                    error: error.to_string(),
                };
            }

            attempt += 1;
            log::debug!(
                "coordination {}: retrying agent {} (attempt {}): {}",
                plan.id,
                agent.agent_id,
                attempt + 1,
                error
            );
        }
    }

    fn append_log(&self, result: ExecutionResult) {
        let mut log = self.log.lock();
        log.push_back(result);
        while log.len() > self.settings.log_limit.max(1) {
            log.pop_front();
        }
    }

    /// Most recent results first.
    pub fn recent_results(&self, limit: usize) -> Vec<ExecutionResult> {
        self.log.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn assign_role(agent: &AgentDescriptor, task_type: &Capability) -> AgentRole {
    if agent.has_capability(Capability::ORCHESTRATION) {
        AgentRole::Coordinator
    } else if agent.capabilities.contains(task_type) {
        AgentRole::Primary
    } else {
        AgentRole::Support
    }
}
