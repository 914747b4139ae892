use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::config::Config;
use crate::engine::balancer::LoadBalancer;
use crate::engine::coordinator::{CoordinationRequest, Coordinator};
use crate::engine::correlation::Correlator;
use crate::engine::gateway::RequestGateway;
use crate::engine::health::HealthMonitor;
use crate::engine::optimizer::Optimizer;
use crate::engine::registry::{spawn_membership_listener, AgentRegistry};
use crate::engine::workflow::{WorkflowEngine, WorkflowOptions};
use crate::error::Result;
use crate::types::{AgentDescriptor, ExecutionResult, WorkflowInstance};

pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Owns every engine component and the background tasks that drive them.
pub struct Orchestrator {
    config: Config,
    bus: MessageBus,
    registry: Arc<AgentRegistry>,
    coordinator: Arc<Coordinator>,
    health: Arc<HealthMonitor>,
    workflows: Arc<WorkflowEngine>,
    optimizer: Arc<Optimizer>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Validates `config` and wires the components on a fresh bus. Must be
    /// called from within a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let bus = MessageBus::new(config.bus_capacity);
        Self::with_bus(config, bus)
    }

    pub fn with_bus(config: Config, bus: MessageBus) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(AgentRegistry::new(
            config.alias_table()?,
            config.health_history_limit,
        ));
        let correlator = Correlator::new(bus.clone(), ORCHESTRATOR_ID);
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            correlator.clone(),
            LoadBalancer::new(config.specialist_min_capabilities),
            config.coordinator_settings(),
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            correlator,
            config.health_settings(),
        ));
        let workflows = Arc::new(WorkflowEngine::new(
            config.template_catalog()?,
            coordinator.clone(),
            bus.clone(),
            ORCHESTRATOR_ID,
            config.workflow_history_limit,
        ));
        let optimizer = Arc::new(Optimizer::new(
            coordinator.clone(),
            bus.clone(),
            ORCHESTRATOR_ID,
        ));

        Ok(Self {
            config,
            bus,
            registry,
            coordinator,
            health,
            workflows,
            optimizer,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the membership listener, the request gateway and the health and
    /// optimizer timers. Calling it again restarts them.
    pub fn start(&self) {
        self.shutdown();

        let gateway = RequestGateway::new(
            self.coordinator.clone(),
            self.workflows.clone(),
            self.bus.clone(),
            ORCHESTRATOR_ID,
        );
        let handles = vec![
            spawn_membership_listener(self.registry.clone(), &self.bus),
            gateway.spawn(),
            self.health
                .clone()
                .spawn(Duration::from_millis(self.config.health_check_interval_ms)),
            self.optimizer
                .clone()
                .spawn(Duration::from_millis(self.config.optimizer_interval_ms)),
        ];
        *self.tasks.lock() = handles;

        log::info!(
            "orchestrator started: health every {}ms, optimizer every {}ms, {} workflow templates",
            self.config.health_check_interval_ms,
            self.config.optimizer_interval_ms,
            self.workflows.catalog().len()
        );
    }

    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in &tasks {
            task.abort();
        }
        log::info!("orchestrator stopped {} background tasks", tasks.len());
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|t| !t.is_finished())
    }

    pub fn register_agent(&self, descriptor: AgentDescriptor) {
        self.registry.register(descriptor);
    }

    pub fn unregister_agent(&self, id: &str) -> Option<AgentDescriptor> {
        self.registry.unregister(id)
    }

    pub async fn coordinate(&self, request: CoordinationRequest) -> Result<ExecutionResult> {
        self.coordinator.coordinate(request).await
    }

    pub async fn orchestrate(
        &self,
        workflow_name: &str,
        data: Value,
        options: WorkflowOptions,
    ) -> Result<WorkflowInstance> {
        self.workflows
            .orchestrate(workflow_name, data, options)
            .await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn optimizer(&self) -> &Arc<Optimizer> {
        &self.optimizer
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
