//! OpenAI-compatible embeddings endpoint.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::common::OpenAiUsage;
use crate::api::extract::ApiJson;
use crate::api::streaming::with_deadline;
use crate::api::types::{optional_vec, OneOrMany};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input: Option<OneOrMany<String>>,
    #[serde(default)]
    pub encoding_format: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingsResponse {
    pub object: &'static str,
    pub data: Vec<EmbeddingObject>,
    pub model: String,
    pub usage: OpenAiUsage,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingObject {
    pub object: &'static str,
    pub index: usize,
    pub embedding: Vec<f32>,
}

pub async fn embeddings(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<EmbeddingsRequest>,
) -> Result<Json<EmbeddingsResponse>, ApiError> {
    if let Some(format) = req.encoding_format.as_deref() {
        if format != "float" {
            return Err(ApiError::bad_request(format!(
                "Unsupported encoding_format '{format}', only 'float' is available"
            )));
        }
    }

    let _permit = state.acquire_permit().await?;
    let embeddings = with_deadline(
        state.request_timeout(),
        state
            .dispatcher
            .embed(req.model.as_deref(), optional_vec(req.input)),
    )
    .await?;

    let data = embeddings
        .vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingObject {
            object: "embedding",
            index,
            embedding,
        })
        .collect();

    Ok(Json(EmbeddingsResponse {
        object: "list",
        data,
        model: embeddings.model.name,
        usage: OpenAiUsage::completion(0),
    }))
}
