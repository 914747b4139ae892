use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::engine::coordinator::{Coordinator, MetricsSnapshot};
use crate::types::{AgentDescriptor, Envelope, MessageKind, Priority};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub agent_count: usize,
    pub average_response_time: f64,
    pub max_load: f64,
    pub success_rate: f64,
    pub average_health: f64,
}

impl SystemMetrics {
    pub fn collect(agents: &[AgentDescriptor], coordination: &MetricsSnapshot) -> Self {
        let count = agents.len();
        let mean = |f: fn(&AgentDescriptor) -> f64| {
            if count == 0 {
                0.0
            } else {
                agents.iter().map(f).sum::<f64>() / count as f64
            }
        };

        Self {
            agent_count: count,
            average_response_time: mean(|a| a.performance_metrics.response_time),
            max_load: agents
                .iter()
                .map(|a| a.performance_metrics.load)
                .fold(0.0, f64::max),
            success_rate: coordination.success_rate,
            average_health: mean(|a| f64::from(a.health_score)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationAction {
    RedistributeLoad,
    ScaleAgents,
    HealthCheckAgents,
}

impl OptimizationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationAction::RedistributeLoad => "redistribute_load",
            OptimizationAction::ScaleAgents => "scale_agents",
            OptimizationAction::HealthCheckAgents => "health_check_agents",
        }
    }
}

pub const SLOW_RESPONSE_MS: f64 = 5_000.0;
pub const MAX_LOAD: f64 = 90.0;
pub const MIN_SUCCESS_RATE: f64 = 95.0;

struct Rule {
    action: OptimizationAction,
    fires: fn(&SystemMetrics) -> bool,
}

const RULES: [Rule; 3] = [
    Rule {
        action: OptimizationAction::RedistributeLoad,
        fires: |m| m.average_response_time > SLOW_RESPONSE_MS,
    },
    Rule {
        action: OptimizationAction::ScaleAgents,
        fires: |m| m.max_load > MAX_LOAD,
    },
    Rule {
        action: OptimizationAction::HealthCheckAgents,
        fires: |m| m.success_rate < MIN_SUCCESS_RATE,
    },
];

/// Actions whose rule fires, in rule order.
pub fn evaluate_rules(metrics: &SystemMetrics) -> Vec<OptimizationAction> {
    RULES
        .iter()
        .filter(|rule| (rule.fires)(metrics))
        .map(|rule| rule.action)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub metrics: SystemMetrics,
    pub actions: Vec<OptimizationAction>,
}

/// Advisory only: fired actions are logged and announced on the bus.
pub struct Optimizer {
    coordinator: Arc<Coordinator>,
    bus: MessageBus,
    sender_id: String,
}

impl Optimizer {
    pub fn new(coordinator: Arc<Coordinator>, bus: MessageBus, sender_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            bus,
            sender_id: sender_id.into(),
        }
    }

    pub fn metrics(&self) -> SystemMetrics {
        let agents = self.coordinator.registry().agents();
        SystemMetrics::collect(&agents, &self.coordinator.metrics())
    }

    pub fn evaluate(&self) -> OptimizationReport {
        let metrics = self.metrics();
        let actions = evaluate_rules(&metrics);

        for action in &actions {
            log::info!(
                "optimizer: {} (avg response {:.0}ms, max load {:.0}, success rate {:.1}%)",
                action.as_str(),
                metrics.average_response_time,
                metrics.max_load,
                metrics.success_rate
            );
            let envelope = Envelope::new(
                MessageKind::OptimizationTrigger,
                self.sender_id.clone(),
                json!({ "action": action, "metrics": metrics }),
            )
            .with_priority(Priority::High);
            self.bus.publish(envelope);
        }

        OptimizationReport { metrics, actions }
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.evaluate();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::balancer::LoadBalancer;
    use crate::engine::coordinator::CoordinatorSettings;
    use crate::engine::correlation::Correlator;
    use crate::engine::registry::AgentRegistry;
    use crate::types::{AliasTable, Capability, PerformanceMetrics};

    fn metrics(rt: f64, load: f64, success: f64) -> SystemMetrics {
        SystemMetrics {
            agent_count: 1,
            average_response_time: rt,
            max_load: load,
            success_rate: success,
            average_health: 100.0,
        }
    }

    #[test]
    fn test_rules_fire_in_order() {
        assert!(evaluate_rules(&metrics(100.0, 10.0, 100.0)).is_empty());
        assert_eq!(
            evaluate_rules(&metrics(6000.0, 95.0, 50.0)),
            vec![
                OptimizationAction::RedistributeLoad,
                OptimizationAction::ScaleAgents,
                OptimizationAction::HealthCheckAgents
            ]
        );
        assert_eq!(
            evaluate_rules(&metrics(5000.0, 90.0, 94.9)),
            vec![OptimizationAction::HealthCheckAgents]
        );
        assert_eq!(
            evaluate_rules(&metrics(6000.0, 10.0, 100.0)),
            vec![OptimizationAction::RedistributeLoad]
        );
        assert_eq!(
            evaluate_rules(&metrics(100.0, 95.0, 100.0)),
            vec![OptimizationAction::ScaleAgents]
        );
    }

    #[test]
    fn test_collect_aggregates_agents() {
        let agent = |id: &str, rt: f64, load: f64, health: u8| {
            let mut a = AgentDescriptor::new(id, [Capability::new("analysis").unwrap()])
                .with_metrics(PerformanceMetrics {
                    response_time: rt,
                    load,
                    ..Default::default()
                });
            a.health_score = health;
            a
        };
        let snapshot = MetricsSnapshot {
            requests_processed: 0,
            requests_successful: 0,
            requests_failed: 0,
            load_balancing_decisions: 0,
            active_coordinations: 0,
            average_execution_ms: 0.0,
            success_rate: 100.0,
        };

        let m = SystemMetrics::collect(
            &[agent("a", 100.0, 20.0, 100), agent("b", 300.0, 70.0, 60)],
            &snapshot,
        );
        assert_eq!(m.agent_count, 2);
        assert_eq!(m.average_response_time, 200.0);
        assert_eq!(m.max_load, 70.0);
        assert_eq!(m.average_health, 80.0);
        assert_eq!(m.success_rate, 100.0);

        let empty = SystemMetrics::collect(&[], &snapshot);
        assert_eq!(empty.average_response_time, 0.0);
        assert_eq!(empty.max_load, 0.0);
    }

    #[tokio::test]
    async fn test_evaluate_publishes_triggers() {
        let bus = MessageBus::new(16);
        let registry = Arc::new(AgentRegistry::new(AliasTable::builtin().unwrap(), 10));
        registry.register(
            AgentDescriptor::new("hot", [Capability::new("analysis").unwrap()]).with_metrics(
                PerformanceMetrics {
                    load: 97.0,
                    ..Default::default()
                },
            ),
        );
        let coordinator = Arc::new(Coordinator::new(
            registry,
            Correlator::new(bus.clone(), "orchestrator"),
            LoadBalancer::default(),
            CoordinatorSettings::default(),
        ));
        let optimizer = Optimizer::new(coordinator, bus.clone(), "orchestrator");
        let mut receiver = bus.subscribe();

        let report = optimizer.evaluate();
        assert_eq!(report.actions, vec![OptimizationAction::ScaleAgents]);

        let trigger = receiver.recv().await.unwrap();
        assert_eq!(trigger.kind, MessageKind::OptimizationTrigger);
        assert_eq!(trigger.payload["action"], "scale_agents");
        assert!(trigger.recipient.is_none());
    }
}
