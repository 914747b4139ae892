//! Serves coordination and workflow requests that arrive over the bus.
//!
//! Every request gets exactly one `RESPONSE` addressed to its sender, with
//! `response_to` set and a `<topic>.result.<id>` or `<topic>.error.<id>` topic.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::engine::coordinator::{CoordinationRequest, Coordinator};
use crate::engine::workflow::{WorkflowEngine, WorkflowOptions};
use crate::error::Result;
use crate::types::message::{error_topic, result_topic};
use crate::types::{Envelope, MessageKind};

pub const COORDINATION_TOPIC: &str = "coordination";
pub const WORKFLOW_TOPIC: &str = "workflow";

#[derive(Debug, Deserialize)]
pub struct WorkflowRequest {
    #[serde(alias = "workflow_name")]
    pub workflow: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub options: WorkflowOptions,
}

#[derive(Clone)]
pub struct RequestGateway {
    coordinator: Arc<Coordinator>,
    workflows: Arc<WorkflowEngine>,
    bus: MessageBus,
    sender_id: String,
}

impl RequestGateway {
    pub fn new(
        coordinator: Arc<Coordinator>,
        workflows: Arc<WorkflowEngine>,
        bus: MessageBus,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            workflows,
            bus,
            sender_id: sender_id.into(),
        }
    }

    /// Each request is served on its own task so a slow coordination does not
    /// hold up the ones behind it.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut receiver = self.bus.subscribe();
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let wanted = matches!(
                    envelope.kind,
                    MessageKind::CoordinationRequest | MessageKind::WorkflowRequest
                );
                if !wanted || !envelope.is_for(&self.sender_id) {
                    continue;
                }
                if envelope.is_expired() {
                    log::debug!("dropping expired request {} from {}", envelope.id, envelope.sender);
                    continue;
                }

                let gateway = self.clone();
                tokio::spawn(async move {
                    let reply = gateway.handle(&envelope).await;
                    gateway.bus.publish(reply);
                });
            }
        })
    }

    /// Runs one request and builds its reply envelope.
    pub async fn handle(&self, request: &Envelope) -> Envelope {
        let (topic, outcome) = match request.kind {
            MessageKind::WorkflowRequest => (WORKFLOW_TOPIC, self.run_workflow(request).await),
            _ => (COORDINATION_TOPIC, self.run_coordination(request).await),
        };

        match outcome {
            Ok(payload) => request
                .reply(self.sender_id.clone(), payload)
                .with_topic(result_topic(topic, request.id)),
            Err(e) => {
                log::warn!("{} request {} failed: {}", topic, request.id, e);
                request
                    .reply(self.sender_id.clone(), json!({ "error": e.to_string() }))
                    .with_topic(error_topic(topic, request.id))
            }
        }
    }

    async fn run_coordination(&self, request: &Envelope) -> Result<Value> {
        let mut coordination: CoordinationRequest =
            serde_json::from_value(request.payload.clone())?;
        if request.priority > coordination.priority {
            coordination.priority = request.priority;
        }
        let result = self.coordinator.coordinate(coordination).await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn run_workflow(&self, request: &Envelope) -> Result<Value> {
        let WorkflowRequest {
            workflow,
            data,
            options,
        } = serde_json::from_value(request.payload.clone())?;
        let instance = self.workflows.orchestrate(&workflow, data, options).await?;
        Ok(serde_json::to_value(instance)?)
    }
}

/// True for replies published on an error topic.
pub fn is_error_reply(envelope: &Envelope) -> bool {
    envelope
        .metadata
        .topic
        .as_deref()
        .is_some_and(|t| t.contains(".error."))
}
