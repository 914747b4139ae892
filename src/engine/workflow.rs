//! Named step sequences run against caller data.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::bus::MessageBus;
use crate::engine::coordinator::{CoordinationOptions, CoordinationRequest, Coordinator};
use crate::error::{CoordinationError, Result};
use crate::types::{
    AgentId, Condition, CoordinationType, Envelope, MessageKind, Priority, Step, StepKind,
    StepResult, WorkflowId, WorkflowInstance, WorkflowTemplate,
};

/// Validated, read-only set of templates keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, WorkflowTemplate>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Result<Self> {
        let mut catalog = Self::new();
        for template in builtin_templates() {
            catalog.insert(template)?;
        }
        Ok(catalog)
    }

    /// Validates and adds a template, replacing any with the same name.
    pub fn insert(&mut self, template: WorkflowTemplate) -> Result<()> {
        template.validate()?;
        if self.templates.contains_key(&template.name) {
            log::info!("workflow template '{}' overridden", template.name);
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Parses a YAML sequence of templates.
    pub fn extend_from_yaml(&mut self, yaml: &str) -> Result<usize> {
        let templates: Vec<WorkflowTemplate> = serde_yaml::from_str(yaml)?;
        let count = templates.len();
        for template in templates {
            self.insert(template)?;
        }
        Ok(count)
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        let count = self.extend_from_yaml(&yaml)?;
        log::info!("loaded {} workflow templates from {}", count, path.display());
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn templates(&self) -> impl Iterator<Item = &WorkflowTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn coordination_step(name: &str, task_type: &str, required: bool) -> Step {
    Step {
        name: name.to_string(),
        required,
        kind: StepKind::AgentCoordination {
            task_type: task_type.to_string(),
            strategy: None,
            agent_ids: None,
            coordination_type: None,
            priority: Priority::Normal,
            max_agents: None,
            min_successful_agents: None,
            timeout_ms: None,
        },
    }
}

fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        WorkflowTemplate {
            name: "document_analysis".to_string(),
            description: "Analyze a document, summarize it and announce the result".to_string(),
            steps: vec![
                Step {
                    name: "validate_input".to_string(),
                    required: true,
                    kind: StepKind::ConditionCheck {
                        condition: Condition::NotEmpty {
                            path: "document".to_string(),
                        },
                    },
                },
                coordination_step("analyze", "analysis", true),
                coordination_step("summarize", "summarization", false),
                Step {
                    name: "announce".to_string(),
                    required: false,
                    kind: StepKind::MessageBroadcast {
                        recipients: Vec::new(),
                        payload: json!({ "event": "document_analyzed" }),
                    },
                },
            ],
        },
        WorkflowTemplate {
            name: "translation_pipeline".to_string(),
            description: "Translate text with one agent at a time, then review it".to_string(),
            steps: vec![
                Step {
                    name: "has_text".to_string(),
                    required: true,
                    kind: StepKind::ConditionCheck {
                        condition: Condition::Exists {
                            path: "text".to_string(),
                        },
                    },
                },
                Step {
                    name: "translate".to_string(),
                    required: true,
                    kind: StepKind::AgentCoordination {
                        task_type: "translation".to_string(),
                        strategy: Some("fastest_response".to_string()),
                        agent_ids: None,
                        coordination_type: Some(CoordinationType::Sequential),
                        priority: Priority::Normal,
                        max_agents: Some(2),
                        min_successful_agents: Some(1),
                        timeout_ms: None,
                    },
                },
                coordination_step("review", "analysis", false),
            ],
        },
        WorkflowTemplate {
            name: "research_report".to_string(),
            description: "Gather research in parallel and summarize the findings".to_string(),
            steps: vec![
                Step {
                    name: "research".to_string(),
                    required: true,
                    kind: StepKind::AgentCoordination {
                        task_type: "research".to_string(),
                        strategy: Some("least_loaded".to_string()),
                        agent_ids: None,
                        coordination_type: Some(CoordinationType::Parallel),
                        priority: Priority::High,
                        max_agents: Some(3),
                        min_successful_agents: Some(1),
                        timeout_ms: None,
                    },
                },
                coordination_step("summarize", "summarization", true),
            ],
        },
    ]
}

/// Per-run overrides applied to every coordination step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowOptions {
    pub priority: Option<Priority>,
    pub timeout_ms: Option<u64>,
}

type StepOutcome = std::result::Result<Value, String>;

pub struct WorkflowEngine {
    catalog: TemplateCatalog,
    coordinator: Arc<Coordinator>,
    bus: MessageBus,
    sender_id: String,
    active: Mutex<HashMap<WorkflowId, WorkflowInstance>>,
    history: Mutex<VecDeque<WorkflowInstance>>,
    history_limit: usize,
}

impl WorkflowEngine {
    pub fn new(
        catalog: TemplateCatalog,
        coordinator: Arc<Coordinator>,
        bus: MessageBus,
        sender_id: impl Into<String>,
        history_limit: usize,
    ) -> Self {
        Self {
            catalog,
            coordinator,
            bus,
            sender_id: sender_id.into(),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Runs `workflow_name` to a terminal state. Step failures are recorded in
    /// the returned instance; only an unknown name is an error.
    pub async fn orchestrate(
        &self,
        workflow_name: &str,
        data: Value,
        options: WorkflowOptions,
    ) -> Result<WorkflowInstance> {
        let template = self
            .catalog
            .get(workflow_name)
            .ok_or_else(|| CoordinationError::UnknownWorkflow(workflow_name.to_string()))?;

        let mut instance = WorkflowInstance::new(&template.name, data);
        log::info!("workflow {} '{}' started", instance.id, template.name);
        self.active.lock().insert(instance.id, instance.clone());
        let _guard = AbandonGuard {
            engine: self,
            id: instance.id,
        };

        for step in &template.steps {
            let started = Instant::now();
            let outcome = self.run_step(step, &instance, &options).await;
            let elapsed = started.elapsed().as_millis() as u64;

            let (result, error) = match outcome {
                Ok(value) => (Some(value), None),
                Err(e) => (None, Some(e)),
            };
            let failed = error.clone();
            instance.steps.push(StepResult {
                name: step.name.clone(),
                step_type: step.kind.type_name().to_string(),
                success: failed.is_none(),
                result,
                error,
                execution_time_ms: elapsed,
            });

            if let Some(reason) = failed {
                if step.required {
                    let err = CoordinationError::RequiredStepFailed {
                        step: step.name.clone(),
                        reason,
                    };
                    instance.fail(err.to_string());
                    break;
                }
                log::warn!(
                    "workflow {}: optional step '{}' failed: {}",
                    instance.id,
                    step.name,
                    reason
                );
            }

            self.active.lock().insert(instance.id, instance.clone());
        }

        if !instance.is_terminal() {
            instance.complete();
        }
        self.finish(&instance);
        Ok(instance)
    }

    async fn run_step(
        &self,
        step: &Step,
        instance: &WorkflowInstance,
        options: &WorkflowOptions,
    ) -> StepOutcome {
        match &step.kind {
            StepKind::AgentCoordination { .. } => {
                self.run_coordination(&step.kind, options).await
            }
            StepKind::MessageBroadcast {
                recipients,
                payload,
            } => Ok(self.run_broadcast(step, instance, recipients, payload)),
            StepKind::ConditionCheck { condition } => run_condition(condition, &instance.data),
        }
    }

    async fn run_coordination(&self, kind: &StepKind, options: &WorkflowOptions) -> StepOutcome {
        let StepKind::AgentCoordination {
            task_type,
            strategy,
            agent_ids,
            coordination_type,
            priority,
            max_agents,
            min_successful_agents,
            timeout_ms,
        } = kind
        else {
            return Err(format!("'{}' is not a coordination step", kind.type_name()));
        };

        let request = CoordinationRequest {
            task_type: task_type.clone(),
            strategy: strategy.clone(),
            agent_ids: agent_ids.clone(),
            priority: options.priority.unwrap_or(*priority),
            options: CoordinationOptions {
                max_agents: *max_agents,
                coordination_type: *coordination_type,
                timeout_ms: options.timeout_ms.or(*timeout_ms),
                min_successful_agents: *min_successful_agents,
                ..Default::default()
            },
        };

        let result = self
            .coordinator
            .coordinate(request)
            .await
            .map_err(|e| e.to_string())?;

        if result.success {
            serde_json::to_value(&result).map_err(|e| e.to_string())
        } else {
            Err(format!(
                "coordination {} succeeded on {} of {} agents",
                result.coordination_id,
                result.fulfilled_count(),
                result.results.len()
            ))
        }
    }

    fn run_broadcast(
        &self,
        step: &Step,
        instance: &WorkflowInstance,
        recipients: &[AgentId],
        payload: &Value,
    ) -> Value {
        let body = json!({
            "workflow_id": instance.id,
            "workflow": instance.workflow,
            "step": step.name,
            "payload": payload,
        });
        let topic = format!("workflow.{}", instance.workflow);

        let delivered = if recipients.is_empty() {
            let envelope = Envelope::new(MessageKind::Broadcast, self.sender_id.clone(), body)
                .with_topic(topic);
            self.bus.publish(envelope)
        } else {
            recipients
                .iter()
                .map(|recipient| {
                    let envelope =
                        Envelope::new(MessageKind::Broadcast, self.sender_id.clone(), body.clone())
                            .to(recipient.clone())
                            .with_topic(topic.clone());
                    self.bus.publish(envelope)
                })
                .sum()
        };

        json!({ "recipients": recipients, "delivered": delivered })
    }

    fn finish(&self, instance: &WorkflowInstance) {
        self.active.lock().remove(&instance.id);
        self.record(instance.clone());

        match &instance.error {
            Some(error) => log::warn!("workflow {} failed: {}", instance.id, error),
            None => log::info!(
                "workflow {} completed with {} steps",
                instance.id,
                instance.steps.len()
            ),
        }
    }

    fn record(&self, instance: WorkflowInstance) {
        let mut history = self.history.lock();
        history.push_back(instance);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    pub fn active(&self) -> Vec<WorkflowInstance> {
        self.active.lock().values().cloned().collect()
    }

    /// Most recent first.
    pub fn history(&self, limit: usize) -> Vec<WorkflowInstance> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }
}

/// Moves an instance whose run was dropped mid-flight into history as failed.
struct AbandonGuard<'a> {
    engine: &'a WorkflowEngine,
    id: WorkflowId,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        let Some(mut instance) = self.engine.active.lock().remove(&self.id) else {
            return;
        };
        instance.fail("workflow abandoned before reaching a terminal state");
        log::warn!(
            "workflow {} '{}' abandoned after {} steps",
            instance.id,
            instance.workflow,
            instance.steps.len()
        );
        self.engine.record(instance);
    }
}

fn run_condition(condition: &Condition, data: &Value) -> StepOutcome {
    if condition.evaluate(data) {
        Ok(json!({ "condition": condition.describe(), "met": true }))
    } else {
        Err(format!("condition not met: {}", condition.describe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::balancer::LoadBalancer;
    use crate::engine::coordinator::CoordinatorSettings;
    use crate::engine::correlation::AgentCaller;
    use crate::engine::registry::AgentRegistry;
    use crate::types::{AgentDescriptor, AliasTable, Capability, RetryPolicy, WorkflowStatus};
    use async_trait::async_trait;
    use std::io::Write;
    use std::time::Duration;

    /// Agents listed in `failing` refuse every task; others succeed.
    struct RecordingCaller {
        failing: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentCaller for RecordingCaller {
        async fn call_agent(
            &self,
            target: &str,
            _kind: MessageKind,
            payload: Value,
            _priority: Priority,
            _timeout: Duration,
        ) -> Result<Envelope> {
            self.calls.lock().push(target.to_string());
            let reply = if self.failing.iter().any(|f| *f == target) {
                json!({"status": "failure", "error": "refused"})
            } else {
                json!({"status": "success", "result": {"task": payload["task_type"]}})
            };
            Ok(Envelope::new(MessageKind::Response, target, reply))
        }
    }

    fn engine_with(
        agents: &[(&str, &str)],
        failing: Vec<&'static str>,
        catalog: TemplateCatalog,
    ) -> (WorkflowEngine, Arc<RecordingCaller>, MessageBus) {
        let registry = Arc::new(AgentRegistry::new(AliasTable::builtin().unwrap(), 10));
        for (id, capability) in agents {
            registry.register(AgentDescriptor::new(
                *id,
                [Capability::new(capability).unwrap()],
            ));
        }
        let caller = Arc::new(RecordingCaller {
            failing,
            calls: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(Coordinator::new(
            registry,
            caller.clone(),
            LoadBalancer::default(),
            CoordinatorSettings {
                default_timeout_ms: 200,
                default_retry_policy: RetryPolicy::none(),
                log_limit: 10,
            },
        ));
        let bus = MessageBus::new(32);
        let engine = WorkflowEngine::new(catalog, coordinator, bus.clone(), "orchestrator", 2);
        (engine, caller, bus)
    }

    fn two_step_template() -> TemplateCatalog {
        let mut catalog = TemplateCatalog::new();
        catalog
            .insert(WorkflowTemplate {
                name: "two_step".into(),
                description: String::new(),
                steps: vec![
                    coordination_step("first", "analysis", true),
                    coordination_step("second", "research", true),
                ],
            })
            .unwrap();
        catalog
    }

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = TemplateCatalog::builtin().unwrap();
        assert_eq!(
            catalog.names(),
            vec!["document_analysis", "research_report", "translation_pipeline"]
        );
    }

    #[test]
    fn test_yaml_templates_are_validated() {
        let mut catalog = TemplateCatalog::new();
        let bad = r#"
- name: dupes
  steps:
    - name: a
      type: condition_check
      condition: { op: exists, path: x }
    - name: a
      type: condition_check
      condition: { op: exists, path: y }
"#;
        assert!(matches!(
            catalog.extend_from_yaml(bad),
            Err(CoordinationError::InvalidConfig(_))
        ));
        assert!(catalog.is_empty());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
- name: notify
  description: ping everyone
  steps:
    - name: ping
      type: message_broadcast
      payload: {{ hello: world }}
"#
        )
        .unwrap();
        assert_eq!(catalog.load_file(file.path()).unwrap(), 1);
        assert!(catalog.get("notify").is_some());
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_rejected() {
        let (engine, _, _) = engine_with(&[], vec![], TemplateCatalog::new());
        let err = engine
            .orchestrate("missing", json!({}), WorkflowOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownWorkflow(name) if name == "missing"));
        assert!(engine.history(10).is_empty());
    }

    #[tokio::test]
    async fn test_required_failure_aborts_remaining_steps() {
        let (engine, caller, _) = engine_with(
            &[("analyst", "analysis"), ("researcher", "research")],
            vec!["analyst"],
            two_step_template(),
        );

        let instance = engine
            .orchestrate("two_step", json!({}), WorkflowOptions::default())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(instance.steps.len(), 1);
        assert!(!instance.steps[0].success);
        assert!(instance.error.as_deref().unwrap().contains("first"));
        assert!(instance.failed_at.is_some());
        assert_eq!(*caller.calls.lock(), vec!["analyst"]);
        assert!(engine.active().is_empty());
        assert_eq!(engine.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_optional_failure_continues() {
        let mut catalog = TemplateCatalog::new();
        catalog
            .insert(WorkflowTemplate {
                name: "lenient".into(),
                description: String::new(),
                steps: vec![
                    coordination_step("maybe", "analysis", false),
                    coordination_step("must", "research", true),
                ],
            })
            .unwrap();
        let (engine, caller, _) = engine_with(
            &[("analyst", "analysis"), ("researcher", "research")],
            vec!["analyst"],
            catalog,
        );

        let instance = engine
            .orchestrate("lenient", json!({}), WorkflowOptions::default())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.steps.len(), 2);
        assert!(!instance.steps[0].success);
        assert!(instance.steps[1].success);
        assert!(instance.error.is_none());
        assert_eq!(caller.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_no_agents_fails_coordination_step() {
        let (engine, _, _) = engine_with(&[], vec![], two_step_template());
        let instance = engine
            .orchestrate("two_step", json!({}), WorkflowOptions::default())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert!(instance.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("No suitable agents"));
    }

    #[tokio::test]
    async fn test_document_analysis_runs_every_step_type() {
        let (engine, caller, bus) = engine_with(
            &[("analyst", "analysis"), ("writer", "summarization")],
            vec![],
            TemplateCatalog::builtin().unwrap(),
        );
        let mut listener = bus.subscribe();

        let instance = engine
            .orchestrate(
                "document_analysis",
                json!({"document": "quarterly numbers"}),
                WorkflowOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Completed);
        let types: Vec<_> = instance.steps.iter().map(|s| s.step_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "condition_check",
                "agent_coordination",
                "agent_coordination",
                "message_broadcast"
            ]
        );
        assert_eq!(caller.calls.lock().len(), 2);

        let announced = listener.recv().await.unwrap();
        assert_eq!(announced.kind, MessageKind::Broadcast);
        assert_eq!(announced.payload["payload"]["event"], "document_analyzed");
        assert_eq!(
            announced.metadata.topic.as_deref(),
            Some("workflow.document_analysis")
        );
    }

    #[tokio::test]
    async fn test_failed_condition_stops_before_agents() {
        let (engine, caller, _) = engine_with(
            &[("analyst", "analysis")],
            vec![],
            TemplateCatalog::builtin().unwrap(),
        );

        let instance = engine
            .orchestrate("document_analysis", json!({"document": ""}), WorkflowOptions::default())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(instance.steps.len(), 1);
        assert!(caller.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (engine, _, _) = engine_with(
            &[("analyst", "analysis"), ("researcher", "research")],
            vec![],
            two_step_template(),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let instance = engine
                .orchestrate("two_step", json!({}), WorkflowOptions::default())
                .await
                .unwrap();
            assert_eq!(instance.status, WorkflowStatus::Completed);
            ids.push(instance.id);
        }

        let history = engine.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[1].id, ids[1]);
    }
}
