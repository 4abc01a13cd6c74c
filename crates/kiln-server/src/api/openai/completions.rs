//! OpenAI-compatible legacy text completions endpoint.
//!
//! `prompt` may be an array; each prompt becomes one choice, generated in
//! order, and a stream ends with a single `[DONE]` after the last choice.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use futures::{Stream, StreamExt};
use kiln_core::{CancellationSignal, CompletionRequest, CompletionStream, PromptInput};
use serde::{Deserialize, Serialize};

use super::common::{
    done_event, error_event, json_event, new_id, now_unix_secs, reject_n, sampling_options,
    OpenAiUsage,
};
use crate::api::extract::ApiJson;
use crate::api::streaming::{bounded_frames, with_deadline, ResponseGuard};
use crate::api::types::{optional_vec, OneOrMany};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct TextCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<OneOrMany<String>>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stop: Option<OneOrMany<String>>,
}

#[derive(Debug, Serialize)]
struct TextCompletion {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<TextChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Serialize)]
struct TextChoice {
    text: String,
    index: usize,
    logprobs: Option<()>,
    finish_reason: Option<&'static str>,
}

pub async fn completions(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<TextCompletionRequest>,
) -> Result<Response, ApiError> {
    reject_n(req.n)?;

    let streaming = req.stream.unwrap_or(false);
    let request = CompletionRequest {
        model: req.model,
        input: PromptInput::Text(optional_vec(req.prompt)),
        options: sampling_options(req.max_tokens, req.temperature, req.top_p, req.seed, req.stop),
    };

    let permit = state.acquire_permit().await?;
    let cancel = CancellationSignal::new();
    let guard = ResponseGuard::new(permit, &cancel);
    let timeout = state.request_timeout();

    if streaming {
        let stream =
            with_deadline(timeout, state.dispatcher.stream(request, cancel.clone())).await?;
        return Ok(Sse::new(completion_events(stream, guard, timeout))
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let completion = with_deadline(timeout, state.dispatcher.complete(request, cancel)).await?;
    drop(guard);

    let completion_tokens = completion.choices.iter().map(|c| c.fragments).sum();
    let choices = completion
        .choices
        .into_iter()
        .enumerate()
        .map(|(index, generated)| TextChoice {
            text: generated.text,
            index,
            logprobs: None,
            finish_reason: Some("stop"),
        })
        .collect();

    Ok(Json(TextCompletion {
        id: new_id("cmpl"),
        object: "text_completion",
        created: now_unix_secs(),
        model: completion.model.name,
        choices,
        usage: Some(OpenAiUsage::completion(completion_tokens)),
    })
    .into_response())
}

fn completion_events(
    stream: CompletionStream,
    guard: ResponseGuard,
    timeout: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let id = new_id("cmpl");
    let created = now_unix_secs();
    let model = stream.model.name.clone();
    let frames = bounded_frames(stream.frames, guard, timeout);

    async_stream::stream! {
        let mut frames = Box::pin(frames);
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    let chunk = TextCompletion {
                        id: id.clone(),
                        object: "text_completion",
                        created,
                        model: model.clone(),
                        choices: vec![TextChoice {
                            text: frame.content,
                            index: frame.index,
                            logprobs: None,
                            finish_reason: frame.is_final.then_some("stop"),
                        }],
                        usage: None,
                    };
                    yield Ok(json_event(&chunk));
                }
                Err(err) => {
                    yield Ok(error_event(&err));
                    break;
                }
            }
        }

        yield Ok(done_event());
    }
}
