//! Helpers shared by the streaming handlers of both protocols.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use futures::{Stream, StreamExt};
use kiln_core::dispatcher::FrameStream;
use kiln_core::engine::CancelOnDrop;
use kiln_core::{CancellationSignal, StreamFrame};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ApiError;

/// Resources tied to one in-flight response. Dropping it, for example when
/// the client disconnects and the body is dropped, cancels generation.
pub struct ResponseGuard {
    _permit: OwnedSemaphorePermit,
    _cancel: CancelOnDrop,
}

impl ResponseGuard {
    pub fn new(permit: OwnedSemaphorePermit, cancel: &CancellationSignal) -> Self {
        Self {
            _permit: permit,
            _cancel: cancel.drop_guard(),
        }
    }
}

/// Forward `frames` until they end, fail, or the deadline passes.
///
/// A failure is yielded once and ends the stream.
pub fn bounded_frames(
    mut frames: FrameStream,
    guard: ResponseGuard,
    timeout: Duration,
) -> impl Stream<Item = Result<StreamFrame, ApiError>> + Send {
    let deadline = Instant::now() + timeout;

    async_stream::stream! {
        let _guard = guard;
        loop {
            match tokio::time::timeout_at(deadline, frames.next()).await {
                Ok(Some(Ok(frame))) => yield Ok(frame),
                Ok(Some(Err(err))) => {
                    warn!("Generation failed mid-stream: {}", err);
                    yield Err(ApiError::from(err));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Streaming request exceeded {:?}", timeout);
                    yield Err(ApiError::timeout("Request timed out"));
                    break;
                }
            }
        }
    }
}

/// Run a non-streaming request under the server's request timeout.
pub async fn with_deadline<T, F>(timeout: Duration, work: F) -> Result<T, ApiError>
where
    F: Future<Output = kiln_core::Result<T>>,
{
    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => Err(ApiError::timeout("Request timed out")),
    }
}

/// Newline-delimited JSON body, one object per line.
pub fn ndjson_response<S>(lines: S) -> Result<Response, ApiError>
where
    S: Stream<Item = serde_json::Value> + Send + 'static,
{
    let body = lines.map(|line| Ok::<_, Infallible>(format!("{line}\n")));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|err| ApiError::internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn guard(cancel: &CancellationSignal) -> (ResponseGuard, Arc<Semaphore>) {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().try_acquire_owned().unwrap();
        (ResponseGuard::new(permit, cancel), semaphore)
    }

    fn frame(content: &str, is_final: bool) -> kiln_core::Result<StreamFrame> {
        Ok(StreamFrame {
            content: content.to_string(),
            is_final,
            index: 0,
        })
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_and_releases_the_permit() {
        let cancel = CancellationSignal::new();
        let (guard, semaphore) = guard(&cancel);
        let frames: FrameStream = Box::pin(stream::pending::<kiln_core::Result<StreamFrame>>());

        let mut bounded = Box::pin(bounded_frames(frames, guard, Duration::from_secs(60)));
        let polled = tokio::time::timeout(Duration::from_millis(20), bounded.next()).await;
        assert!(polled.is_err());
        assert!(!cancel.is_cancelled());
        assert_eq!(semaphore.available_permits(), 0);

        drop(bounded);
        assert!(cancel.is_cancelled());
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn engine_error_ends_the_stream() {
        let cancel = CancellationSignal::new();
        let (guard, _semaphore) = guard(&cancel);
        let frames: FrameStream = Box::pin(stream::iter(vec![
            frame("a", false),
            Err(kiln_core::Error::generation("device lost")),
            frame("b", true),
        ]));

        let items: Vec<_> = bounded_frames(frames, guard, Duration::from_secs(60))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        let err = items[1].as_ref().err().unwrap();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn deadline_yields_timeout() {
        let cancel = CancellationSignal::new();
        let (guard, _semaphore) = guard(&cancel);
        let frames: FrameStream = Box::pin(stream::pending::<kiln_core::Result<StreamFrame>>());

        let items: Vec<_> = bounded_frames(frames, guard, Duration::from_millis(10))
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().err().unwrap().status,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert!(cancel.is_cancelled());
    }
}
