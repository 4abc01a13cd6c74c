//! Ollama-compatible API namespace.
//!
//! Streams are newline-delimited JSON. Every line but the last carries
//! `done: false`; the last carries `done: true` with timing and counts.

pub mod chat;
pub mod embed;
pub mod generate;
pub mod models;

use std::time::{Duration, Instant};

use axum::{
    response::Response,
    routing::{get, post},
    Router,
};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use kiln_core::{CompletionStream, SamplingOptions};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::api::streaming::{bounded_frames, ndjson_response, ResponseGuard};
use crate::error::{ApiError, Protocol};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/generate", post(generate::generate))
        .route("/api/chat", post(chat::chat))
        .route("/api/embed", post(embed::embed))
        .route("/api/embeddings", post(embed::embeddings))
        .route("/api/tags", get(models::tags))
        .route("/api/show", post(models::show))
        .route("/api/ps", get(models::ps))
        .route("/api/version", get(models::version))
}

/// Runtime options accepted under `options`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OllamaOptions {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Negative means "as many as allowed".
    #[serde(default)]
    pub num_predict: Option<i64>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

pub fn sampling_options(options: Option<OllamaOptions>) -> SamplingOptions {
    let options = options.unwrap_or_default();
    SamplingOptions {
        max_tokens: options
            .num_predict
            .map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
        temperature: options.temperature,
        top_p: options.top_p,
        seed: options.seed,
        stop: options.stop.unwrap_or_default(),
    }
}

pub fn ollama_error(err: ApiError) -> ApiError {
    err.with_protocol(Protocol::Ollama)
}

pub fn created_at() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// How generated text is placed in a response line.
#[derive(Debug, Clone, Copy)]
pub enum Payload {
    /// `"response": "<text>"` as in `/api/generate`.
    Response,
    /// `"message": {"role": "assistant", "content": "<text>"}` as in `/api/chat`.
    Message,
}

impl Payload {
    fn insert(&self, line: &mut Map<String, Value>, text: String) {
        match self {
            Payload::Response => {
                line.insert("response".into(), Value::String(text));
            }
            Payload::Message => {
                line.insert(
                    "message".into(),
                    json!({ "role": "assistant", "content": text }),
                );
            }
        }
    }
}

/// Request timing reported on the terminal line.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub started: Instant,
    /// When the engine became ready and generation could begin.
    pub ready: Instant,
}

impl Timings {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            ready: now,
        }
    }

    pub fn mark_ready(&mut self) {
        self.ready = Instant::now();
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// One response line. `eval_count` is set only on the terminal line.
pub fn response_line(
    model: &str,
    payload: Payload,
    text: String,
    done: Option<(usize, Timings)>,
) -> Value {
    let mut line = Map::new();
    line.insert("model".into(), Value::String(model.to_string()));
    line.insert("created_at".into(), Value::String(created_at()));
    payload.insert(&mut line, text);

    match done {
        None => {
            line.insert("done".into(), Value::Bool(false));
        }
        Some((eval_count, timings)) => {
            let now = Instant::now();
            line.insert("done".into(), Value::Bool(true));
            line.insert("done_reason".into(), Value::String("stop".into()));
            line.insert(
                "total_duration".into(),
                json!(nanos(now.duration_since(timings.started))),
            );
            line.insert(
                "load_duration".into(),
                json!(nanos(timings.ready.duration_since(timings.started))),
            );
            line.insert("eval_count".into(), json!(eval_count));
            line.insert(
                "eval_duration".into(),
                json!(nanos(now.duration_since(timings.ready))),
            );
        }
    }

    Value::Object(line)
}

/// Write a completion stream as NDJSON. Only the last frame of the whole
/// batch is marked `done: true`; a failure becomes a final `{"error": ...}` line.
pub fn ndjson_frames(
    stream: CompletionStream,
    guard: ResponseGuard,
    timeout: Duration,
    payload: Payload,
    timings: Timings,
) -> Result<Response, ApiError> {
    let model = stream.model.name.clone();
    let batch_size = stream.batch_size;
    let frames = bounded_frames(stream.frames, guard, timeout);

    let lines = async_stream::stream! {
        let mut frames = Box::pin(frames);
        let mut eval_count = 0usize;
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    if !frame.content.is_empty() {
                        eval_count += 1;
                    }
                    let done = frame
                        .ends_batch(batch_size)
                        .then_some((eval_count, timings));
                    yield response_line(&model, payload, frame.content, done);
                }
                Err(err) => {
                    yield ollama_error(err).body();
                    break;
                }
            }
        }
    };

    ndjson_response(lines)
}
