//! API endpoints for workflows.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::engine::Engine;
use crate::workflow::Workflow;

/// Get a workflow's current status.
pub async fn get_workflow(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, StatusCode> {
    engine.workflow(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}
