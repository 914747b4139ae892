use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::engine::coordinator::{CoordinationRequest, MetricsSnapshot};
use crate::engine::optimizer::SystemMetrics;
use crate::engine::registry::RoutingTable;
use crate::engine::workflow::WorkflowOptions;
use crate::error::CoordinationError;
use crate::types::{
    AgentDescriptor, AgentStatus, Capability, ExecutionResult, HealthRecord, PerformanceMetrics,
    WorkflowInstance, WorkflowTemplate,
};

#[derive(Deserialize)]
pub struct RegisterAgentRequest {
    pub id: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
}

#[derive(Serialize)]
pub struct AgentHealthResponse {
    pub agent_id: String,
    pub health_score: u8,
    pub status: AgentStatus,
    pub history: Vec<HealthRecord>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct RunWorkflowRequest {
    pub data: Value,
    pub options: WorkflowOptions,
}

#[derive(Serialize)]
pub struct WorkflowsResponse {
    pub templates: Vec<WorkflowTemplate>,
    pub active: Vec<WorkflowInstance>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub coordination: MetricsSnapshot,
    pub system: SystemMetrics,
}

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "agents": state.orchestrator.registry().len(),
    }))
}

pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentDescriptor>> {
    Json(state.orchestrator.registry().agents())
}

pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentDescriptor>)> {
    if request.id.trim().is_empty() {
        return Err(ApiError::BadRequest("agent id must not be empty".to_string()));
    }
    let capabilities = request
        .capabilities
        .iter()
        .map(Capability::new)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let descriptor = AgentDescriptor::new(request.id.clone(), capabilities)
        .with_metrics(request.performance_metrics);
    let registry = state.orchestrator.registry();
    registry.register(descriptor);

    let registered = registry
        .get(&request.id)
        .ok_or_else(|| ApiError::NotFound(request.id.clone()))?;
    Ok((StatusCode::CREATED, Json(registered)))
}

pub async fn unregister_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentDescriptor>> {
    state
        .orchestrator
        .unregister_agent(&id)
        .map(Json)
        .ok_or_else(|| CoordinationError::UnknownAgent(id).into())
}

pub async fn get_agent_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentHealthResponse>> {
    let registry = state.orchestrator.registry();
    let agent = registry
        .get(&id)
        .ok_or_else(|| CoordinationError::UnknownAgent(id.clone()))?;

    Ok(Json(AgentHealthResponse {
        agent_id: agent.id,
        health_score: agent.health_score,
        status: agent.status,
        history: registry.health_history(&id),
    }))
}

pub async fn get_routing(State(state): State<AppState>) -> Json<RoutingTable> {
    Json(state.orchestrator.registry().routing_table())
}

pub async fn coordinate(
    State(state): State<AppState>,
    Json(request): Json<CoordinationRequest>,
) -> ApiResult<Json<ExecutionResult>> {
    let result = state.orchestrator.coordinate(request).await?;
    Ok(Json(result))
}

pub async fn run_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<RunWorkflowRequest>>,
) -> ApiResult<Json<WorkflowInstance>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let instance = state
        .orchestrator
        .orchestrate(&name, request.data, request.options)
        .await?;
    Ok(Json(instance))
}

pub async fn list_workflows(State(state): State<AppState>) -> Json<WorkflowsResponse> {
    let workflows = state.orchestrator.workflows();
    Json(WorkflowsResponse {
        templates: workflows.catalog().templates().cloned().collect(),
        active: workflows.active(),
    })
}

pub async fn workflow_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<WorkflowInstance>> {
    let limit = query.limit.unwrap_or(state.orchestrator.config().workflow_history_limit);
    Json(state.orchestrator.workflows().history(limit))
}

pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        coordination: state.orchestrator.coordinator().metrics(),
        system: state.orchestrator.optimizer().metrics(),
    })
}
