//! Ollama-compatible model listing and inspection.

use std::collections::HashSet;

use axum::{extract::State, Json};
use chrono::{DateTime, SecondsFormat, Utc};
use kiln_core::{BackendKind, EngineCapabilities, ModelDescriptor, ModelIdentity};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ollama_error;
use crate::api::extract::OllamaJson;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ModelDetails {
    pub format: &'static str,
    pub family: String,
    pub quantization_level: String,
}

#[derive(Debug, Serialize)]
pub struct TagEntry {
    pub name: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    pub size: u64,
    pub details: ModelDetails,
}

#[derive(Debug, Serialize)]
pub struct TagsResponse {
    pub models: Vec<TagEntry>,
}

#[derive(Debug, Serialize)]
pub struct RunningEntry {
    pub name: String,
    pub model: String,
    pub size: u64,
    pub size_vram: u64,
    pub details: ModelDetails,
}

#[derive(Debug, Serialize)]
pub struct PsResponse {
    pub models: Vec<RunningEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowRequest {
    #[serde(default)]
    pub model: Option<String>,
    /// Older clients send `name`.
    #[serde(default)]
    pub name: Option<String>,
}

fn details(model: &ModelDescriptor) -> ModelDetails {
    ModelDetails {
        format: "gguf",
        family: String::new(),
        quantization_level: model.quantization.clone(),
    }
}

fn rfc3339(unix_secs: u64) -> Option<String> {
    let secs = i64::try_from(unix_secs).ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn capability_names(capabilities: &EngineCapabilities) -> Vec<&'static str> {
    let mut names = Vec::new();
    if capabilities.supports_generation {
        names.push("completion");
    }
    if capabilities.supports_embeddings {
        names.push("embedding");
    }
    names
}

pub async fn tags(State(state): State<AppState>) -> Result<Json<TagsResponse>, ApiError> {
    let models = state
        .dispatcher
        .catalog()
        .list()
        .await
        .map_err(ApiError::ollama)?
        .into_iter()
        .map(|model| TagEntry {
            details: details(&model),
            modified_at: model.modified_at.and_then(rfc3339),
            size: model.size_bytes,
            model: model.name.clone(),
            name: model.name,
        })
        .collect();

    Ok(Json(TagsResponse { models }))
}

pub async fn show(
    State(state): State<AppState>,
    OllamaJson(req): OllamaJson<ShowRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = req
        .model
        .or(req.name)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| ollama_error(ApiError::bad_request("`model` is required")))?;

    let model = state
        .dispatcher
        .catalog()
        .lookup(&name)
        .await
        .map_err(ApiError::ollama)?
        .ok_or_else(|| ollama_error(ApiError::not_found(format!("model '{name}' not found"))))?;

    // Capabilities are only known for a model that has been loaded.
    let capabilities = match state.dispatcher.registry().get(&model.identity).await {
        Some(engine) => engine.capabilities().ok().map(|c| capability_names(&c)),
        None => None,
    };

    let mut body = json!({
        "details": details(&model),
        "model_info": {
            "general.file_path": model.path.display().to_string(),
            "general.file_size": model.size_bytes,
            "general.quantization": model.quantization,
        },
        "modified_at": model.modified_at.and_then(rfc3339),
    });
    if let Some(capabilities) = capabilities {
        body["capabilities"] = json!(capabilities);
    }

    Ok(Json(body))
}

pub async fn ps(State(state): State<AppState>) -> Result<Json<PsResponse>, ApiError> {
    let loaded: HashSet<ModelIdentity> = state
        .dispatcher
        .registry()
        .loaded()
        .await
        .into_iter()
        .collect();
    let on_gpu = state.backend().kind == BackendKind::Gpu;

    let models = state
        .dispatcher
        .catalog()
        .list()
        .await
        .map_err(ApiError::ollama)?
        .into_iter()
        .filter(|model| loaded.contains(&model.identity))
        .map(|model| RunningEntry {
            details: details(&model),
            size: model.size_bytes,
            size_vram: if on_gpu { model.size_bytes } else { 0 },
            model: model.name.clone(),
            name: model.name,
        })
        .collect();

    Ok(Json(PsResponse { models }))
}

pub async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}
