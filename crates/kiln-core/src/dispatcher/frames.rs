//! Re-framing of engine fragments into protocol-neutral stream frames.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamFrame {
    pub content: String,
    /// Last frame of the response at `index`.
    pub is_final: bool,
    /// Position of the prompt within a batch; 0 for single requests.
    pub index: usize,
}

impl StreamFrame {
    /// True for the very last frame of a batch of `batch_size` responses.
    pub fn ends_batch(&self, batch_size: usize) -> bool {
        self.is_final && self.index + 1 >= batch_size
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame>> + Send>>;

/// Hold each fragment until the next one (or the end) is seen, so the final
/// frame is known when it is emitted.
///
/// Emits exactly one `is_final` frame, always last, and preserves order. An
/// engine that produced nothing yields one empty final frame. An engine
/// error is passed through after the frames already seen and ends the stream
/// without a final frame.
pub fn lookahead<S>(index: usize, fragments: S) -> FrameStream
where
    S: Stream<Item = Result<String>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut fragments = Box::pin(fragments);
        let mut held: Option<String> = None;

        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => {
                    if let Some(previous) = held.replace(fragment) {
                        yield Ok(StreamFrame { content: previous, is_final: false, index });
                    }
                }
                Err(err) => {
                    if let Some(previous) = held.take() {
                        yield Ok(StreamFrame { content: previous, is_final: false, index });
                    }
                    yield Err(err);
                    return;
                }
            }
        }

        yield Ok(StreamFrame {
            content: held.unwrap_or_default(),
            is_final: true,
            index,
        });
    })
}
