//! Pieces shared by the OpenAI-compatible handlers.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::response::sse::Event;
use kiln_core::SamplingOptions;
use serde::Serialize;

use crate::api::types::{optional_vec, OneOrMany};
use crate::error::ApiError;

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl OpenAiUsage {
    /// Prompt tokens are not counted; fragments stand in for completion tokens.
    pub fn completion(completion_tokens: usize) -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens,
            total_tokens: completion_tokens,
        }
    }
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

pub fn sampling_options(
    max_tokens: Option<usize>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    seed: Option<u64>,
    stop: Option<OneOrMany<String>>,
) -> SamplingOptions {
    SamplingOptions {
        max_tokens,
        temperature,
        top_p,
        seed,
        stop: optional_vec(stop),
    }
}

pub fn reject_n(n: Option<usize>) -> Result<(), ApiError> {
    if n.unwrap_or(1) != 1 {
        return Err(ApiError::bad_request(
            "This server currently supports only `n=1`",
        ));
    }
    Ok(())
}

pub fn json_event<T: Serialize>(value: &T) -> Event {
    Event::default().data(serde_json::to_string(value).unwrap_or_default())
}

/// A failure after the stream started, written in place of the next chunk.
pub fn error_event(err: &ApiError) -> Event {
    Event::default().data(err.body().to_string())
}

pub fn done_event() -> Event {
    Event::default().data("[DONE]")
}
