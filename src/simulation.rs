//! Scripted in-process worker agents.
//!
//! A simulated agent listens on the bus for messages addressed to it, answers
//! `COORDINATION_TASK` with its scripted behavior and answers status queries
//! with a status report.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::engine::registry::register_message;
use crate::error::Result;
use crate::types::message::StatusMetrics;
use crate::types::{
    AgentDescriptor, AgentId, AgentReply, Capability, Envelope, MessageKind, StatusReport,
    TaskMessage,
};

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { delay: Duration },
    Fail { reason: String },
    /// Never answers anything.
    Silent,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior::Succeed {
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedAgent {
    descriptor: AgentDescriptor,
    behavior: Behavior,
    status: StatusReport,
}

impl SimulatedAgent {
    pub fn new(id: impl Into<AgentId>, capabilities: &[&str]) -> Result<Self> {
        let capabilities = capabilities
            .iter()
            .map(Capability::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            descriptor: AgentDescriptor::new(id, capabilities),
            behavior: Behavior::default(),
            status: StatusReport {
                status: "active".to_string(),
                metrics: StatusMetrics::default(),
            },
        })
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_status(mut self, status: StatusReport) -> Self {
        self.status = status;
        self
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// `AGENT_REGISTER` announcement for this agent.
    pub fn registration(&self) -> Envelope {
        register_message(&self.descriptor.id, &self.descriptor)
    }

    pub fn spawn(self, bus: &MessageBus) -> SimulatedAgentHandle {
        let mut receiver = bus.subscribe();
        let bus = bus.clone();
        let counters = Counters::default();
        let handle_counters = counters.clone();
        let id = self.descriptor.id.clone();
        let agent = Arc::new(self);

        let task = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                if envelope.recipient.as_deref() != Some(agent.descriptor.id.as_str()) {
                    continue;
                }
                match envelope.kind {
                    MessageKind::CoordinationTask => {
                        counters.tasks.fetch_add(1, Ordering::SeqCst);
                        let agent = agent.clone();
                        let bus = bus.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = agent.answer_task(&envelope).await {
                                bus.publish(reply);
                            }
                        });
                    }
                    MessageKind::Query => {
                        counters.queries.fetch_add(1, Ordering::SeqCst);
                        if let Some(reply) = agent.answer_query(&envelope) {
                            bus.publish(reply);
                        }
                    }
                    _ => {}
                }
            }
        });

        SimulatedAgentHandle {
            id,
            counters: handle_counters,
            task,
        }
    }

    async fn answer_task(&self, request: &Envelope) -> Option<Envelope> {
        let reply = match &self.behavior {
            Behavior::Silent => return None,
            Behavior::Fail { reason } => AgentReply::failure(reason.clone()),
            Behavior::Succeed { delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                AgentReply::success(self.work(&request.payload))
            }
        };
        Some(request.reply(self.descriptor.id.clone(), reply.to_value()))
    }

    fn work(&self, payload: &Value) -> Value {
        match serde_json::from_value::<TaskMessage>(payload.clone()) {
            Ok(task) => json!({
                "agent": self.descriptor.id,
                "task_type": task.task_type,
                "role": task.role,
                "coordination_id": task.coordination_id,
            }),
            Err(_) => json!({ "agent": self.descriptor.id, "echo": payload }),
        }
    }

    fn answer_query(&self, request: &Envelope) -> Option<Envelope> {
        if matches!(self.behavior, Behavior::Silent) {
            return None;
        }
        let status = serde_json::to_value(&self.status).ok()?;
        Some(request.reply(self.descriptor.id.clone(), status))
    }
}

#[derive(Debug, Clone, Default)]
struct Counters {
    tasks: Arc<AtomicUsize>,
    queries: Arc<AtomicUsize>,
}

/// Stops the agent when dropped.
pub struct SimulatedAgentHandle {
    id: AgentId,
    counters: Counters,
    task: JoinHandle<()>,
}

impl SimulatedAgentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Coordination tasks received so far.
    pub fn dispatched(&self) -> usize {
        self.counters.tasks.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.counters.queries.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SimulatedAgentHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
