//! Inference engine contract.
//!
//! Every component talks to the native computation through [`InferenceEngine`].
//! An engine owns the weights of exactly one model and moves through
//! `Uninitialized -> Initializing -> Ready | Failed`, ending in `Disposed`.

pub mod candle;
pub mod template;
pub mod text;

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::backend::BackendDescriptor;
use crate::catalog::ModelIdentity;
use crate::error::{Error, Result};

pub use candle::{CandleEngineFactory, CandleGgufEngine};
pub use template::{ChatMessage, ChatRole, ChatTemplate};

/// Ordered, finite stream of generated text fragments.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Smallest number of tokens a request may ask for.
pub const MIN_MAX_TOKENS: usize = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCapabilities {
    pub supports_embeddings: bool,
    pub supports_generation: bool,
    pub supports_gpu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    Disposed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
    pub stop_sequences: Vec<String>,
}

impl GenerationParams {
    /// Clamp `max_tokens` into `[MIN_MAX_TOKENS, ceiling]` and range-check sampling values.
    pub fn validated(mut self, ceiling: usize) -> Result<Self> {
        if !(0.0..=2.0).contains(&self.temperature) || self.temperature.is_nan() {
            return Err(Error::Validation(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::Validation(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        self.max_tokens = self
            .max_tokens
            .clamp(MIN_MAX_TOKENS, ceiling.max(MIN_MAX_TOKENS));
        self.stop_sequences.retain(|stop| !stop.is_empty());
        Ok(self)
    }
}

/// Per-request cancellation flag shared between the protocol layer and the engine loop.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Guard that cancels when dropped, e.g. together with a response body.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop(self.clone())
    }
}

#[derive(Debug)]
pub struct CancelOnDrop(CancellationSignal);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load weights. A call while another is in flight, or after success, is rejected.
    async fn initialize(&self, model_path: &Path) -> Result<()>;

    fn state(&self) -> EngineState;

    /// Valid once the engine is ready.
    fn capabilities(&self) -> Result<EngineCapabilities>;

    /// Layout used to turn chat messages into a prompt.
    fn chat_template(&self) -> ChatTemplate {
        ChatTemplate::default()
    }

    /// Produce fragments in order. The consumer must drain or drop the stream;
    /// dropping it or tripping `cancel` stops the computation.
    async fn generate_text_stream(
        &self,
        params: GenerationParams,
        cancel: CancellationSignal,
    ) -> Result<TextStream>;

    async fn generate_text(
        &self,
        params: GenerationParams,
        cancel: CancellationSignal,
    ) -> Result<String> {
        let mut stream = self.generate_text_stream(params, cancel).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Known once the first embedding call has succeeded, or earlier if metadata says.
    fn embedding_dimension(&self) -> Option<usize>;

    async fn dispose(&self);
}

/// Builds uninitialized engines for the registry.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        identity: &ModelIdentity,
        backend: &BackendDescriptor,
    ) -> Result<Arc<dyn InferenceEngine>>;
}

/// State machine shared by engine implementations.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<EngineState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(EngineState::Uninitialized),
        }
    }
}

impl Lifecycle {
    pub fn current(&self) -> EngineState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(EngineState::Failed)
    }

    /// Move to `Initializing`; only allowed from `Uninitialized` or `Failed`.
    pub fn begin_initialize(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Precondition("engine state lock poisoned".into()))?;
        match *state {
            EngineState::Uninitialized | EngineState::Failed => {
                *state = EngineState::Initializing;
                Ok(())
            }
            EngineState::Initializing => Err(Error::Precondition(
                "engine initialization already in progress".into(),
            )),
            EngineState::Ready => Err(Error::Precondition("engine already initialized".into())),
            EngineState::Disposed => Err(Error::Precondition("engine has been disposed".into())),
        }
    }

    pub fn finish_initialize(&self, ok: bool) {
        if let Ok(mut state) = self.state.lock() {
            if *state == EngineState::Initializing {
                *state = if ok {
                    EngineState::Ready
                } else {
                    EngineState::Failed
                };
            }
        }
    }

    pub fn require_ready(&self) -> Result<()> {
        match self.current() {
            EngineState::Ready => Ok(()),
            EngineState::Disposed => Err(Error::Precondition("engine has been disposed".into())),
            other => Err(Error::Precondition(format!(
                "engine is not ready (state: {other:?})"
            ))),
        }
    }

    pub fn dispose(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = EngineState::Disposed;
        }
    }
}

/// Lock `mutex`, clearing poison left by a panicked holder.
pub fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Recovering engine state after a panicked generation");
        mutex.clear_poison();
        poisoned.into_inner()
    })
}

/// Run a blocking fragment producer. Its error, or a panic, is sent as the last item.
pub fn spawn_producer<F>(tx: mpsc::Sender<Result<String>>, produce: F)
where
    F: FnOnce(&mpsc::Sender<Result<String>>) -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let err = match panic::catch_unwind(AssertUnwindSafe(|| produce(&tx))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Generation panicked: {}", detail);
                Error::generation(format!("generation panicked: {detail}"))
            }
        };
        let _ = tx.blocking_send(Err(err));
    });
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedEngine;
    use super::*;

    fn params(max_tokens: usize, temperature: f64) -> GenerationParams {
        GenerationParams {
            prompt: "hi".into(),
            max_tokens,
            temperature,
            top_p: 0.9,
            seed: 1,
            stop_sequences: vec![String::new(), "\n\n".into()],
        }
    }

    #[tokio::test]
    async fn panicking_producer_ends_with_generation_error() {
        let (tx, rx) = mpsc::channel(4);
        spawn_producer(tx, |tx| {
            let _ = tx.blocking_send(Ok("partial".to_string()));
            panic!("index out of bounds");
        });

        let frames: Vec<_> =
            crate::dispatcher::frames::lookahead(0, tokio_stream::wrappers::ReceiverStream::new(rx))
                .collect()
                .await;
        assert_eq!(frames.len(), 2);
        let first = frames[0].as_ref().unwrap();
        assert_eq!(first.content, "partial");
        assert!(!first.is_final);
        match &frames[1] {
            Err(Error::Generation { message, .. }) => {
                assert!(message.contains("index out of bounds"))
            }
            other => panic!("expected generation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn producer_error_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        spawn_producer(tx, |_| Err(Error::Validation("prompt produced no tokens".into())));
        assert!(matches!(rx.recv().await, Some(Err(Error::Validation(_)))));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let shared = Arc::new(Mutex::new(1));
        let holder = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.lock().unwrap();
            panic!("generation step failed");
        })
        .join();
        assert!(shared.is_poisoned());

        *lock_recovering(&shared) += 1;
        assert!(!shared.is_poisoned());
        assert_eq!(*lock_recovering(&shared), 2);
    }

    #[test]
    fn max_tokens_is_clamped_to_floor_and_ceiling() {
        assert_eq!(params(0, 0.5).validated(100).unwrap().max_tokens, 1);
        assert_eq!(params(5000, 0.5).validated(100).unwrap().max_tokens, 100);
        assert_eq!(params(0, 0.5).validated(100).unwrap().stop_sequences, vec!["\n\n"]);
    }

    #[test]
    fn temperature_outside_range_is_rejected() {
        assert!(matches!(
            params(10, 2.5).validated(100),
            Err(Error::Validation(_))
        ));
        assert!(params(10, 0.0).validated(100).is_ok());
    }

    #[test]
    fn lifecycle_rejects_reinitialize_and_use_after_dispose() {
        let lifecycle = Lifecycle::default();
        assert!(lifecycle.require_ready().is_err());
        lifecycle.begin_initialize().unwrap();
        assert!(matches!(
            lifecycle.begin_initialize(),
            Err(Error::Precondition(_))
        ));
        lifecycle.finish_initialize(true);
        assert_eq!(lifecycle.current(), EngineState::Ready);
        assert!(lifecycle.begin_initialize().is_err());

        lifecycle.dispose();
        assert!(matches!(lifecycle.require_ready(), Err(Error::Precondition(_))));
    }

    #[test]
    fn failed_initialize_can_be_retried() {
        let lifecycle = Lifecycle::default();
        lifecycle.begin_initialize().unwrap();
        lifecycle.finish_initialize(false);
        assert_eq!(lifecycle.current(), EngineState::Failed);
        assert!(lifecycle.begin_initialize().is_ok());
    }

    #[test]
    fn drop_guard_trips_signal() {
        let signal = CancellationSignal::new();
        {
            let _guard = signal.drop_guard();
            assert!(!signal.is_cancelled());
        }
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn default_generate_text_concatenates_stream() {
        let engine = ScriptedEngine::generating(&["Hel", "lo", "!"]);
        engine.initialize(Path::new("m.gguf")).await.unwrap();
        let text = engine
            .generate_text(params(8, 0.0), CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(text, "Hello!");
    }

    #[tokio::test]
    async fn use_before_initialize_is_precondition_error() {
        let engine = ScriptedEngine::generating(&["x"]);
        let err = engine
            .generate_text(params(8, 0.0), CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(engine.capabilities().is_err());
    }
}
