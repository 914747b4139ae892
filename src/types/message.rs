use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AgentId, AgentRole, CoordinationId, MessageId, Priority};

pub const QUERY_STATUS: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    AgentRegister,
    AgentUnregister,
    CoordinationTask,
    Query,
    Response,
    CoordinationRequest,
    WorkflowRequest,
    Broadcast,
    OptimizationTrigger,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_to: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Caller-facing channel name, e.g. `coordination.result.<id>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<AgentId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metadata: MessageMetadata,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageKind, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            id: MessageId::new_v4(),
            kind,
            sender: sender.into(),
            recipient: None,
            payload,
            priority: Priority::Normal,
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn to(mut self, recipient: impl Into<AgentId>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.metadata.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.metadata.topic = Some(topic.into());
        self
    }

    pub fn in_response_to(mut self, request: MessageId) -> Self {
        self.metadata.response_to = Some(request);
        self
    }

    /// Builds the response envelope for this message, addressed back to its sender.
    pub fn reply(&self, sender: impl Into<String>, payload: Value) -> Envelope {
        Envelope::new(MessageKind::Response, sender, payload)
            .to(self.sender.clone())
            .with_priority(self.priority)
            .in_response_to(self.id)
    }

    /// Broadcasts (no recipient) are for everyone.
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.recipient.as_deref().map_or(true, |r| r == agent_id)
    }

    pub fn is_expired(&self) -> bool {
        match self.metadata.ttl_ms {
            Some(ttl) => {
                let age = Utc::now().signed_duration_since(self.created_at);
                age.num_milliseconds() > ttl as i64
            }
            None => false,
        }
    }
}

pub fn result_topic(topic: &str, request: MessageId) -> String {
    format!("{}.result.{}", topic, request)
}

pub fn error_topic(topic: &str, request: MessageId) -> String {
    format!("{}.error.{}", topic, request)
}

/// Payload of a `COORDINATION_TASK` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_type: String,
    pub role: AgentRole,
    pub priority: Priority,
    pub coordination_id: CoordinationId,
}

/// Terminal answer from a worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentReply {
    Success {
        #[serde(default)]
        result: Value,
    },
    Failure {
        error: String,
    },
}

impl AgentReply {
    pub fn success(result: Value) -> Self {
        AgentReply::Success { result }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        AgentReply::Failure {
            error: error.into(),
        }
    }

    /// Interprets a raw reply payload. Payloads without a recognized `status`
    /// tag count as success unless they carry a string `error` field.
    pub fn from_payload(payload: &Value) -> Self {
        if let Ok(reply) = serde_json::from_value::<AgentReply>(payload.clone()) {
            return reply;
        }

        match payload.get("error").and_then(|e| e.as_str()) {
            Some(error) => AgentReply::failure(error),
            None => AgentReply::success(payload.clone()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Expected answer to a status `QUERY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: String,
    #[serde(default)]
    pub metrics: StatusMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusMetrics {
    pub errors: u64,
    pub average_response_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
}

impl StatusReport {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }
}
