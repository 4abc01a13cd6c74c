//! Ollama-compatible embedding endpoints.

use std::time::Instant;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::ollama_error;
use crate::api::extract::OllamaJson;
use crate::api::streaming::with_deadline;
use crate::api::types::{optional_vec, OneOrMany};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input: Option<OneOrMany<String>>,
}

#[derive(Debug, Serialize)]
pub struct EmbedResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
    pub total_duration: u64,
}

/// Legacy single-prompt form.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingsResponse {
    pub embedding: Vec<f32>,
}

async fn embed_texts(
    state: &AppState,
    model: Option<&str>,
    input: Vec<String>,
) -> Result<kiln_core::Embeddings, ApiError> {
    let _permit = state.acquire_permit().await?;
    with_deadline(
        state.request_timeout(),
        state.dispatcher.embed(model, input),
    )
    .await
}

pub async fn embed(
    State(state): State<AppState>,
    OllamaJson(req): OllamaJson<EmbedRequest>,
) -> Result<Json<EmbedResponse>, ApiError> {
    let started = Instant::now();
    let embeddings = embed_texts(&state, req.model.as_deref(), optional_vec(req.input))
        .await
        .map_err(ollama_error)?;

    Ok(Json(EmbedResponse {
        model: embeddings.model.name,
        embeddings: embeddings.vectors,
        total_duration: u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX),
    }))
}

pub async fn embeddings(
    State(state): State<AppState>,
    OllamaJson(req): OllamaJson<EmbeddingsRequest>,
) -> Result<Json<EmbeddingsResponse>, ApiError> {
    let input = req.prompt.into_iter().collect();
    let embeddings = embed_texts(&state, req.model.as_deref(), input)
        .await
        .map_err(ollama_error)?;

    Ok(Json(EmbeddingsResponse {
        embedding: embeddings.vectors.into_iter().next().unwrap_or_default(),
    }))
}
