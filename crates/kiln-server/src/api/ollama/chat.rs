//! Ollama-compatible `/api/chat`.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use kiln_core::{CancellationSignal, ChatMessage, ChatRole, CompletionRequest, PromptInput};
use serde::Deserialize;

use super::{
    ndjson_frames, ollama_error, response_line, sampling_options, OllamaOptions, Payload, Timings,
};
use crate::api::extract::OllamaJson;
use crate::api::streaming::{with_deadline, ResponseGuard};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<OllamaMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub options: Option<OllamaOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

fn to_core_messages(messages: Vec<OllamaMessage>) -> Result<Vec<ChatMessage>, ApiError> {
    messages
        .into_iter()
        .map(|message| -> Result<ChatMessage, ApiError> {
            let role: ChatRole = message.role.parse()?;
            Ok(ChatMessage::new(role, message.content))
        })
        .collect()
}

pub async fn chat(
    State(state): State<AppState>,
    OllamaJson(req): OllamaJson<ChatRequest>,
) -> Result<Response, ApiError> {
    chat_inner(state, req).await.map_err(ollama_error)
}

async fn chat_inner(state: AppState, req: ChatRequest) -> Result<Response, ApiError> {
    let mut timings = Timings::start();
    let streaming = req.stream.unwrap_or(true);
    let request = CompletionRequest {
        model: req.model,
        input: PromptInput::Chat(to_core_messages(req.messages)?),
        options: sampling_options(req.options),
    };

    let permit = state.acquire_permit().await?;
    let cancel = CancellationSignal::new();
    let guard = ResponseGuard::new(permit, &cancel);
    let timeout = state.request_timeout();

    if streaming {
        let stream =
            with_deadline(timeout, state.dispatcher.stream(request, cancel.clone())).await?;
        timings.mark_ready();
        return ndjson_frames(stream, guard, timeout, Payload::Message, timings);
    }

    let completion = with_deadline(timeout, state.dispatcher.complete(request, cancel)).await?;
    drop(guard);

    let generated = completion.choices.into_iter().next().unwrap_or_default();
    Ok(Json(response_line(
        &completion.model.name,
        Payload::Message,
        generated.text,
        Some((generated.fragments, timings)),
    ))
    .into_response())
}
