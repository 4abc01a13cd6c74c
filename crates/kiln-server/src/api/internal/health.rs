//! Liveness and backend status.

use axum::{extract::State, Json};
use kiln_core::BackendDescriptor;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when no native backend could be loaded.
    pub status: &'static str,
    pub backend: BackendDescriptor,
    pub loaded_models: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let backend = state.backend().clone();
    let status = if backend.loaded { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        backend,
        loaded_models: state.dispatcher.registry().loaded().await.len(),
    })
}
