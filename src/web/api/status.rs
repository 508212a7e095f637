//! Engine status and dead-letter inspection.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};

use crate::bus::DeadLetter;
use crate::engine::{Engine, EngineStatus};

pub async fn get_status(State(engine): State<Arc<Engine>>) -> Json<EngineStatus> {
    Json(engine.status().await)
}

pub async fn list_dead_letters(State(engine): State<Arc<Engine>>) -> Result<Json<Vec<DeadLetter>>, StatusCode> {
    engine.dead_letters().map(Json).map_err(|e| {
        tracing::error!("Failed to read dead letters: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
