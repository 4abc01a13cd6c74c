//! OpenAI-compatible API namespace.

pub mod chat;
pub mod common;
pub mod completions;
pub mod embeddings;
pub mod models;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(chat::completions))
        .route("/completions", post(completions::completions))
        .route("/embeddings", post(embeddings::embeddings))
        .route("/models", get(models::list_models_openai))
        .route("/models/:model", get(models::get_model_openai))
}
