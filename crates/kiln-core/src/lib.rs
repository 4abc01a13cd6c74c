//! Kiln Core - local GGUF inference behind a fixed engine contract
//!
//! This crate holds everything below the HTTP layer:
//! - [`backend`]: one-shot native backend selection with CPU fallback
//! - [`engine`]: the inference engine contract and the candle GGUF engine
//! - [`registry`]: single-flight, cached engine construction per model
//! - [`catalog`]: model name resolution and quantization ranking
//! - [`dispatcher`]: request validation, generation and stream framing
//!
//! # Example
//!
//! ```ignore
//! use kiln_core::{BackendSelector, KilnConfig};
//!
//! let config = KilnConfig::from_env()?;
//! let selector = BackendSelector::for_settings(&config.backend);
//! let backend = selector.configure(&config.backend).await;
//! println!("running on {}", backend.kind);
//! ```

pub mod backend;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod registry;

pub use backend::{
    BackendDescriptor, BackendKind, BackendPreference, BackendSelector, NativeLoader,
};
pub use catalog::{GgufCandidate, LocalCatalog, ModelCatalog, ModelDescriptor, ModelIdentity};
pub use config::{BackendSettings, GenerationDefaults, KilnConfig};
pub use dispatcher::{
    Completion, CompletionDispatcher, CompletionRequest, CompletionStream, Embeddings, Operation,
    PromptInput, SamplingOptions, StreamFrame,
};
pub use engine::{
    CancellationSignal, ChatMessage, ChatRole, EngineCapabilities, EngineFactory, EngineState,
    GenerationParams, InferenceEngine,
};
pub use error::{Error, Result};
pub use registry::EngineRegistry;
