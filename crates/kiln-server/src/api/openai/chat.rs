//! OpenAI-compatible chat completions endpoint.

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
use kiln_core::{
    CancellationSignal, ChatMessage, ChatRole, CompletionRequest, CompletionStream, PromptInput,
};
use serde::{Deserialize, Serialize};

use super::common::{
    done_event, error_event, json_event, new_id, now_unix_secs, reject_n, sampling_options,
    OpenAiUsage,
};
use crate::api::extract::ApiJson;
use crate::api::streaming::{bounded_frames, with_deadline, ResponseGuard};
use crate::api::types::OneOrMany;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<OpenAiInboundMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub max_completion_tokens: Option<usize>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stream_options: Option<ChatCompletionStreamOptions>,
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

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionStreamOptions {
    #[serde(default)]
    pub include_usage: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiInboundMessage {
    pub role: String,
    pub content: OpenAiInboundContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OpenAiInboundContent {
    Text(String),
    Parts(Vec<OpenAiInboundContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiInboundContentPart {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub input_text: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiChatCompletionResponse {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
}

#[derive(Debug, Serialize)]
struct OpenAiChoice {
    index: usize,
    message: OpenAiAssistantMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAiAssistantMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiChatChunk {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<OpenAiChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Serialize)]
struct OpenAiChunkChoice {
    index: usize,
    delta: OpenAiDelta,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct OpenAiDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

fn to_core_messages(messages: Vec<OpenAiInboundMessage>) -> Result<Vec<ChatMessage>, ApiError> {
    messages
        .into_iter()
        .map(|message| -> Result<ChatMessage, ApiError> {
            let role: ChatRole = message.role.parse()?;
            let content = flatten_content(message.content);
            if content.trim().is_empty() {
                return Err(ApiError::bad_request(
                    "Chat message content cannot be empty",
                ));
            }
            Ok(ChatMessage::new(role, content))
        })
        .collect()
}

fn flatten_content(content: OpenAiInboundContent) -> String {
    match content {
        OpenAiInboundContent::Text(text) => text,
        OpenAiInboundContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| match part.kind.as_deref() {
                Some("text") | Some("input_text") | None => part.text.or(part.input_text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

pub async fn completions(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    reject_n(req.n)?;

    let include_usage = req
        .stream_options
        .as_ref()
        .and_then(|opts| opts.include_usage)
        .unwrap_or(false);
    let streaming = req.stream.unwrap_or(false);
    let request = CompletionRequest {
        model: req.model,
        input: PromptInput::Chat(to_core_messages(req.messages)?),
        options: sampling_options(
            req.max_completion_tokens.or(req.max_tokens),
            req.temperature,
            req.top_p,
            req.seed,
            req.stop,
        ),
    };

    let permit = state.acquire_permit().await?;
    let cancel = CancellationSignal::new();
    let guard = ResponseGuard::new(permit, &cancel);
    let timeout = state.request_timeout();

    if streaming {
        let stream =
            with_deadline(timeout, state.dispatcher.stream(request, cancel.clone())).await?;
        let events = chat_events(stream, guard, timeout, include_usage);
        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let completion = with_deadline(timeout, state.dispatcher.complete(request, cancel)).await?;
    drop(guard);

    let generated = completion.choices.into_iter().next().unwrap_or_default();
    let response = OpenAiChatCompletionResponse {
        id: new_id("chatcmpl"),
        object: "chat.completion",
        created: now_unix_secs(),
        model: completion.model.name,
        choices: vec![OpenAiChoice {
            index: 0,
            message: OpenAiAssistantMessage {
                role: "assistant",
                content: generated.text,
            },
            finish_reason: "stop",
        }],
        usage: OpenAiUsage::completion(generated.fragments),
    };

    Ok(Json(response).into_response())
}

fn chat_events(
    stream: CompletionStream,
    guard: ResponseGuard,
    timeout: Duration,
    include_usage: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let id = new_id("chatcmpl");
    let created = now_unix_secs();
    let model = stream.model.name.clone();
    let frames = bounded_frames(stream.frames, guard, timeout);

    let chunk = move |delta: OpenAiDelta,
                      finish_reason: Option<&'static str>,
                      usage: Option<OpenAiUsage>| OpenAiChatChunk {
        id: id.clone(),
        object: "chat.completion.chunk",
        created,
        model: model.clone(),
        choices: vec![OpenAiChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        usage,
    };

    async_stream::stream! {
        yield Ok(json_event(&chunk(
            OpenAiDelta { role: Some("assistant"), content: None },
            None,
            None,
        )));

        let mut frames = Box::pin(frames);
        let mut completion_tokens = 0usize;
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    let has_content = !frame.content.is_empty();
                    if has_content {
                        completion_tokens += 1;
                    }
                    let finish_reason = frame.is_final.then_some("stop");
                    let usage = (frame.is_final && include_usage)
                        .then(|| OpenAiUsage::completion(completion_tokens));
                    let delta = OpenAiDelta {
                        role: None,
                        content: has_content.then_some(frame.content),
                    };
                    yield Ok(json_event(&chunk(delta, finish_reason, usage)));
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
