//! Error types for Kiln

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing request fields. Always raised before an engine is touched.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The resolved engine cannot perform the requested operation.
    #[error("Unsupported operation: {0}")]
    Capability(String),

    /// Engine used before initialization, after disposal, or initialized twice.
    #[error("Engine precondition failed: {0}")]
    Precondition(String),

    #[error("Native backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Generation failed: {message}")]
    Generation {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a native computation failure, keeping the original cause attached.
    pub fn generation_from(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Generation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Short machine-readable code used by protocol error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::Config(_) => "invalid_request",
            Error::ModelNotFound(_) => "model_not_found",
            Error::Capability(_) => "unsupported_operation",
            Error::BackendUnavailable(_) => "backend_unavailable",
            _ => "internal_error",
        }
    }
}

impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        Error::generation_from("native computation failed", err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::generation_from("worker task did not complete", err)
    }
}
