//! Stateless agent selection strategies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{AgentDescriptor, AgentId, Priority, Strategy, Tier};

pub const DEFAULT_SPECIALIST_MIN_CAPABILITIES: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionOptions {
    pub max_agents: Option<usize>,
    /// Per-agent weights for the weighted strategy; missing agents weigh 1.
    pub weights: HashMap<AgentId, f64>,
    /// Marks the task as complex, which makes capability-based selection
    /// prefer specialists regardless of priority.
    pub complex: bool,
}

struct SelectionContext<'a> {
    limit: usize,
    weights: &'a HashMap<AgentId, f64>,
    complex: bool,
    specialist_min: usize,
}

type SelectFn = fn(&[AgentDescriptor], Priority, &SelectionContext<'_>) -> Vec<AgentDescriptor>;

fn selector(strategy: Strategy) -> SelectFn {
    match strategy {
        Strategy::RoundRobin => round_robin,
        Strategy::LeastLoaded => least_loaded,
        Strategy::Weighted => weighted,
        Strategy::CapabilityBased => capability_based,
        Strategy::FastestResponse => fastest_response,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadBalancer {
    specialist_min_capabilities: usize,
}

impl LoadBalancer {
    pub fn new(specialist_min_capabilities: usize) -> Self {
        Self {
            specialist_min_capabilities: specialist_min_capabilities.max(1),
        }
    }

    /// Picks at most `options.max_agents` (or the strategy default) candidates.
    pub fn select(
        &self,
        strategy: Strategy,
        candidates: &[AgentDescriptor],
        priority: Priority,
        options: &SelectionOptions,
    ) -> Vec<AgentDescriptor> {
        let context = SelectionContext {
            limit: options
                .max_agents
                .unwrap_or_else(|| strategy.default_max_agents()),
            weights: &options.weights,
            complex: options.complex,
            specialist_min: self.specialist_min_capabilities,
        };
        let mut selected = selector(strategy)(candidates, priority, &context);
        selected.truncate(context.limit);
        selected
    }

    pub fn tier_of(&self, agent: &AgentDescriptor) -> Tier {
        Tier::classify(agent.capabilities.len(), self.specialist_min_capabilities)
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(DEFAULT_SPECIALIST_MIN_CAPABILITIES)
    }
}

fn round_robin(
    candidates: &[AgentDescriptor],
    _priority: Priority,
    ctx: &SelectionContext<'_>,
) -> Vec<AgentDescriptor> {
    candidates.iter().take(ctx.limit).cloned().collect()
}

fn least_loaded(
    candidates: &[AgentDescriptor],
    _priority: Priority,
    ctx: &SelectionContext<'_>,
) -> Vec<AgentDescriptor> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| {
        a.performance_metrics
            .load
            .total_cmp(&b.performance_metrics.load)
    });
    sorted.truncate(ctx.limit);
    sorted
}

fn weighted(
    candidates: &[AgentDescriptor],
    _priority: Priority,
    ctx: &SelectionContext<'_>,
) -> Vec<AgentDescriptor> {
    let weight = |agent: &AgentDescriptor| ctx.weights.get(&agent.id).copied().unwrap_or(1.0);
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| weight(b).total_cmp(&weight(a)));
    sorted.truncate(ctx.limit);
    sorted
}

fn capability_based(
    candidates: &[AgentDescriptor],
    priority: Priority,
    ctx: &SelectionContext<'_>,
) -> Vec<AgentDescriptor> {
    let (specialists, generalists): (Vec<_>, Vec<_>) = candidates
        .iter()
        .partition(|a| Tier::classify(a.capabilities.len(), ctx.specialist_min) == Tier::Specialist);

    let (preferred, backfill) = if priority.is_high() || ctx.complex {
        (specialists, generalists)
    } else {
        (generalists, specialists)
    };

    preferred
        .into_iter()
        .chain(backfill)
        .take(ctx.limit)
        .cloned()
        .collect()
}

fn fastest_response(
    candidates: &[AgentDescriptor],
    _priority: Priority,
    ctx: &SelectionContext<'_>,
) -> Vec<AgentDescriptor> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| {
        a.performance_metrics
            .response_time
            .total_cmp(&b.performance_metrics.response_time)
    });
    sorted.truncate(ctx.limit);
    sorted
}
