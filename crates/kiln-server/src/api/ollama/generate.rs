//! Ollama-compatible `/api/generate`.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use kiln_core::{
    CancellationSignal, ChatMessage, ChatRole, CompletionRequest, Operation, PromptInput,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{
    created_at, ndjson_frames, ollama_error, response_line, sampling_options, OllamaOptions,
    Payload, Timings,
};
use crate::api::extract::OllamaJson;
use crate::api::streaming::{with_deadline, ResponseGuard};
use crate::api::types::{optional_vec, OneOrMany};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<OneOrMany<String>>,
    #[serde(default)]
    pub system: Option<String>,
    /// Skip the chat template and send the prompt as-is.
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub options: Option<OllamaOptions>,
}

/// A single prompt is wrapped in the model's chat template unless `raw` is
/// set. A batch of prompts is always sent raw.
fn prompt_input(
    prompts: Vec<String>,
    system: Option<String>,
    raw: bool,
) -> Result<PromptInput, ApiError> {
    let system = system.filter(|s| !s.trim().is_empty());
    match prompts.len() {
        1 if !raw => {
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = system {
                messages.push(ChatMessage::new(ChatRole::System, system));
            }
            messages.extend(
                prompts
                    .into_iter()
                    .map(|prompt| ChatMessage::new(ChatRole::User, prompt)),
            );
            Ok(PromptInput::Chat(messages))
        }
        n if n > 1 && system.is_some() => Err(ApiError::bad_request(
            "`system` cannot be combined with a batch of prompts",
        )),
        _ => Ok(PromptInput::Text(prompts)),
    }
}

pub async fn generate(
    State(state): State<AppState>,
    OllamaJson(req): OllamaJson<GenerateRequest>,
) -> Result<Response, ApiError> {
    generate_inner(state, req).await.map_err(ollama_error)
}

async fn generate_inner(state: AppState, req: GenerateRequest) -> Result<Response, ApiError> {
    let mut timings = Timings::start();
    let prompts = optional_vec(req.prompt);

    // An empty prompt only loads the model.
    if prompts.is_empty() || (prompts.len() == 1 && prompts[0].is_empty()) {
        let resolved = with_deadline(
            state.request_timeout(),
            state
                .dispatcher
                .resolve(req.model.as_deref(), Operation::Generation),
        )
        .await?;
        info!("Loaded model {} on request", resolved.descriptor.name);
        return Ok(Json(json!({
            "model": resolved.descriptor.name,
            "created_at": created_at(),
            "response": "",
            "done": true,
            "done_reason": "load"
        }))
        .into_response());
    }

    let streaming = req.stream.unwrap_or(true);
    let request = CompletionRequest {
        model: req.model,
        input: prompt_input(prompts, req.system, req.raw)?,
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
        return ndjson_frames(stream, guard, timeout, Payload::Response, timings);
    }

    let completion = with_deadline(timeout, state.dispatcher.complete(request, cancel)).await?;
    drop(guard);

    let mut responses: Vec<Value> = completion
        .choices
        .into_iter()
        .map(|generated| {
            response_line(
                &completion.model.name,
                Payload::Response,
                generated.text,
                Some((generated.fragments, timings)),
            )
        })
        .collect();

    if responses.len() == 1 {
        return Ok(Json(responses.remove(0)).into_response());
    }
    Ok(Json(Value::Array(responses)).into_response())
}
