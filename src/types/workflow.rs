use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use super::{AgentId, Capability, CoordinationType, Priority, WorkflowId};
use crate::error::{CoordinationError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
}

impl WorkflowTemplate {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoordinationError::InvalidConfig(
                "workflow template name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(CoordinationError::InvalidConfig(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(CoordinationError::InvalidConfig(format!(
                    "workflow '{}' declares step '{}' twice",
                    self.name, step.name
                )));
            }
            if let StepKind::AgentCoordination { task_type, .. } = &step.kind {
                Capability::new(task_type).map_err(|e| {
                    CoordinationError::InvalidConfig(format!(
                        "workflow '{}' step '{}': {}",
                        self.name, step.name, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(flatten)]
    pub kind: StepKind,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    AgentCoordination {
        task_type: String,
        #[serde(default)]
        strategy: Option<String>,
        #[serde(default)]
        agent_ids: Option<Vec<AgentId>>,
        #[serde(default)]
        coordination_type: Option<CoordinationType>,
        #[serde(default)]
        priority: Priority,
        #[serde(default)]
        max_agents: Option<usize>,
        #[serde(default)]
        min_successful_agents: Option<usize>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    MessageBroadcast {
        #[serde(default)]
        recipients: Vec<AgentId>,
        #[serde(default)]
        payload: Value,
    },
    ConditionCheck {
        condition: Condition,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::AgentCoordination { .. } => "agent_coordination",
            StepKind::MessageBroadcast { .. } => "message_broadcast",
            StepKind::ConditionCheck { .. } => "condition_check",
        }
    }
}

/// Predicate over workflow data. `path` is a dotted path such as `order.items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Exists { path: String },
    NotEmpty { path: String },
    Equals { path: String, value: Value },
    GreaterThan { path: String, value: f64 },
    LessThan { path: String, value: f64 },
}

impl Condition {
    pub fn evaluate(&self, data: &Value) -> bool {
        match self {
            Condition::Exists { path } => lookup(data, path).is_some_and(|v| !v.is_null()),
            Condition::NotEmpty { path } => match lookup(data, path) {
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(Value::Object(o)) => !o.is_empty(),
                Some(Value::Null) | None => false,
                Some(_) => true,
            },
            Condition::Equals { path, value } => lookup(data, path) == Some(value),
            Condition::GreaterThan { path, value } => lookup(data, path)
                .and_then(Value::as_f64)
                .is_some_and(|v| v > *value),
            Condition::LessThan { path, value } => lookup(data, path)
                .and_then(Value::as_f64)
                .is_some_and(|v| v < *value),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Condition::Exists { path } => format!("'{}' exists", path),
            Condition::NotEmpty { path } => format!("'{}' is not empty", path),
            Condition::Equals { path, value } => format!("'{}' equals {}", path, value),
            Condition::GreaterThan { path, value } => format!("'{}' > {}", path, value),
            Condition::LessThan { path, value } => format!("'{}' < {}", path, value),
        }
    }
}

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(data, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub step_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub workflow: String,
    pub data: Value,
    pub status: WorkflowStatus,
    pub steps: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowInstance {
    pub fn new(workflow: impl Into<String>, data: Value) -> Self {
        Self {
            id: WorkflowId::new_v4(),
            workflow: workflow.into(),
            data,
            status: WorkflowStatus::Running,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            error: None,
        }
    }

    pub fn complete(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = WorkflowStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn is_terminal(&self) -> bool {
        self.status != WorkflowStatus::Running
    }
}
