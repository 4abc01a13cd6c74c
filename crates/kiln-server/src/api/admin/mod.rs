//! Local administrative API namespace.

use std::collections::HashSet;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use kiln_core::{GgufCandidate, ModelDescriptor, ModelIdentity};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::streaming::with_deadline;
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/models", get(list_models))
        .route("/admin/models/:model/load", post(load_model))
        .route("/admin/remote/*repo", get(remote_candidates))
}

#[derive(Debug, Serialize)]
pub struct AdminModel {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    pub loaded: bool,
}

#[derive(Debug, Serialize)]
pub struct AdminModelsResponse {
    pub models: Vec<AdminModel>,
}

pub async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<AdminModelsResponse>, ApiError> {
    let loaded: HashSet<ModelIdentity> = state
        .dispatcher
        .registry()
        .loaded()
        .await
        .into_iter()
        .collect();

    let models = state
        .dispatcher
        .catalog()
        .list()
        .await?
        .into_iter()
        .map(|descriptor| AdminModel {
            loaded: loaded.contains(&descriptor.identity),
            descriptor,
        })
        .collect();

    Ok(Json(AdminModelsResponse { models }))
}

/// Load a model ahead of its first request.
pub async fn load_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<AdminModel>, ApiError> {
    let descriptor = state
        .dispatcher
        .catalog()
        .lookup(&model)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("model '{model}' not found")))?;

    with_deadline(
        state.request_timeout(),
        state.dispatcher.registry().get_or_create(&descriptor.identity),
    )
    .await?;
    info!("Preloaded model {}", descriptor.name);

    Ok(Json(AdminModel {
        descriptor,
        loaded: true,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RemoteQuery {
    #[serde(default)]
    pub revision: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoteCandidate {
    #[serde(flatten)]
    pub candidate: GgufCandidate,
    pub tier: u8,
}

#[derive(Debug, Serialize)]
pub struct RemoteCandidatesResponse {
    pub repo: String,
    pub revision: String,
    pub best: Option<String>,
    pub candidates: Vec<RemoteCandidate>,
}

/// Ranked GGUF files of a remote repository, best first.
pub async fn remote_candidates(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Query(query): Query<RemoteQuery>,
) -> Result<Json<RemoteCandidatesResponse>, ApiError> {
    let repo = repo.trim_matches('/').to_string();
    let revision = query.revision.unwrap_or_else(|| "main".to_string());

    let candidates = state.remote.list_candidates(&repo, &revision).await?;
    let best = candidates
        .first()
        .filter(|candidate| candidate.is_main_model_file)
        .map(|candidate| candidate.path.display().to_string());

    Ok(Json(RemoteCandidatesResponse {
        repo,
        revision,
        best,
        candidates: candidates
            .into_iter()
            .map(|candidate| RemoteCandidate {
                tier: candidate.tier(),
                candidate,
            })
            .collect(),
    }))
}
