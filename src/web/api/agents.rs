//! API endpoints for agents.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::engine::{AgentSummary, Engine};
use crate::error::Error;
use crate::selector::{Candidate, SelectionRequest};

/// Selection API response.
#[derive(Serialize)]
pub struct SelectionResponse {
    pub agent_id: String,
    pub candidates: Vec<Candidate>,
}

/// List all agents.
pub async fn list_agents(State(engine): State<Arc<Engine>>) -> Json<Vec<AgentSummary>> {
    Json(engine.list_agents())
}

/// Get a single agent.
pub async fn get_agent(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<AgentSummary>, StatusCode> {
    engine.get_agent(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// Unregister an agent.
pub async fn delete_agent(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    match engine.unregister_agent(&id).await {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Pick the best agent for a task.
pub async fn select_agent(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<SelectionRequest>,
) -> Result<Json<SelectionResponse>, StatusCode> {
    let candidates = engine.rank(&request);
    match engine.select_best(&request) {
        Ok(agent_id) => Ok(Json(SelectionResponse { agent_id, candidates })),
        Err(Error::NoCandidate { .. }) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Selection failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
