//! OpenAI-compatible model resource handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use kiln_core::ModelDescriptor;
use serde::Serialize;

use super::common::now_unix_secs;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OpenAiModelsResponse {
    pub object: &'static str,
    pub data: Vec<OpenAiModel>,
}

#[derive(Debug, Serialize)]
pub struct OpenAiModel {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl From<ModelDescriptor> for OpenAiModel {
    fn from(model: ModelDescriptor) -> Self {
        Self {
            id: model.name,
            object: "model",
            created: model.modified_at.unwrap_or_else(now_unix_secs),
            owned_by: "local",
            root: Some(model.path.display().to_string()),
            parent: None,
        }
    }
}

pub async fn list_models_openai(
    State(state): State<AppState>,
) -> Result<Json<OpenAiModelsResponse>, ApiError> {
    let data = state
        .dispatcher
        .catalog()
        .list()
        .await?
        .into_iter()
        .map(OpenAiModel::from)
        .collect();

    Ok(Json(OpenAiModelsResponse {
        object: "list",
        data,
    }))
}

pub async fn get_model_openai(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<OpenAiModel>, ApiError> {
    let descriptor = state
        .dispatcher
        .catalog()
        .lookup(&model)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("model '{model}' not found")))?;

    Ok(Json(OpenAiModel::from(descriptor)))
}
