use thiserror::Error;

use crate::types::AgentId;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Agent {agent_id} did not respond within {timeout_ms}ms")]
    Timeout { agent_id: AgentId, timeout_ms: u64 },

    #[error("No suitable agents found for task type '{task_type}'")]
    NoSuitableAgents { task_type: String },

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Required step '{step}' failed: {reason}")]
    RequiredStepFailed { step: String, reason: String },

    #[error("Health check failed for agent {agent_id}: {reason}")]
    HealthCheck { agent_id: AgentId, reason: String },

    #[error("Agent {agent_id} reported failure: {reason}")]
    AgentFailure { agent_id: AgentId, reason: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Invalid task type: {0}")]
    InvalidTaskType(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Message bus closed")]
    BusClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CoordinationError {
    /// Request-level errors that reject the caller's request as a whole.
    /// Everything else is per-agent and gets recorded as data.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NoSuitableAgents { .. }
                | Self::UnknownWorkflow(_)
                | Self::InvalidTaskType(_)
                | Self::InvalidConfig(_)
                | Self::UnknownAgent(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
