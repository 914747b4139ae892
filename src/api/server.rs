use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::engine::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/agents", get(handlers::list_agents))
        .route("/agents", post(handlers::register_agent))
        .route("/agents/:id", delete(handlers::unregister_agent))
        .route("/agents/:id/health", get(handlers::get_agent_health))
        .route("/routing", get(handlers::get_routing))
        .route("/coordinate", post(handlers::coordinate))
        .route("/workflows", get(handlers::list_workflows))
        .route("/workflows/history", get(handlers::workflow_history))
        .route("/workflows/:name", post(handlers::run_workflow))
        .route("/metrics", get(handlers::get_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    log::info!("conductor API listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}
