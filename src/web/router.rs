//! Route definitions for the admin API.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use super::api;
use crate::engine::Engine;

/// Create the API router.
pub fn create_api_router() -> Router<Arc<Engine>> {
    Router::new()
        .route("/status", get(api::get_status))
        // Agents
        .route("/agents", get(api::list_agents))
        .route("/agents/:id", get(api::get_agent).delete(api::delete_agent))
        // Selection
        .route("/select", post(api::select_agent))
        // Workflows
        .route("/workflows/:id", get(api::get_workflow))
        .route("/dead-letters", get(api::list_dead_letters))
}

/// Create the full app router.
pub fn create_app_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .nest("/api", create_api_router())
        .route("/health", get(health_check))
        .with_state(engine)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
