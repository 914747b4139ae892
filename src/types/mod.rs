pub mod agent;
pub mod capability;
pub mod message;
pub mod plan;
pub mod workflow;

pub use agent::{AgentDescriptor, HealthRecord, PerformanceMetrics};
pub use capability::{AliasTable, Capability};
pub use message::{AgentReply, Envelope, MessageKind, MessageMetadata, StatusReport, TaskMessage};
pub use plan::{
    AgentOutcome, AgentRole, BackoffKind, CoordinationPlan, CoordinationType, ExecutionResult,
    PlannedAgent, RetryPolicy, Strategy, SuccessCriteria, Tier,
};
pub use workflow::{
    Condition, Step, StepKind, StepResult, WorkflowInstance, WorkflowStatus, WorkflowTemplate,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AgentId = String;
pub type MessageId = Uuid;
pub type CoordinationId = Uuid;
pub type WorkflowId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Unhealthy,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn is_high(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}
