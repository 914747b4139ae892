pub mod balancer;
pub mod coordinator;
pub mod correlation;
pub mod gateway;
pub mod health;
pub mod optimizer;
pub mod orchestrator;
pub mod registry;
pub mod workflow;

pub use balancer::{LoadBalancer, SelectionOptions};
pub use coordinator::{CoordinationOptions, CoordinationRequest, Coordinator, MetricsSnapshot};
pub use correlation::{AgentCaller, Correlator};
pub use gateway::RequestGateway;
pub use health::{HealthCheckReport, HealthMonitor};
pub use optimizer::{OptimizationAction, Optimizer, SystemMetrics};
pub use orchestrator::Orchestrator;
pub use registry::{AgentRegistry, RoutingTable};
pub use workflow::{TemplateCatalog, WorkflowEngine, WorkflowOptions};
