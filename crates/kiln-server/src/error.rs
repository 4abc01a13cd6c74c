//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Which wire protocol's error envelope to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Ollama,
}

/// API error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub protocol: Protocol,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            protocol: Protocol::OpenAi,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "model_not_found", msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout", msg)
    }

    /// Convert a core error into the legacy protocol's envelope.
    pub fn ollama(err: kiln_core::Error) -> Self {
        Self::from(err).with_protocol(Protocol::Ollama)
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    fn openai_type(&self) -> &'static str {
        match self.status {
            StatusCode::BAD_REQUEST => "invalid_request_error",
            StatusCode::NOT_FOUND => "not_found_error",
            StatusCode::FORBIDDEN => "permission_error",
            StatusCode::GATEWAY_TIMEOUT => "timeout_error",
            _ => "server_error",
        }
    }

    /// Body of the envelope, also written inline when a stream fails after headers.
    pub fn body(&self) -> serde_json::Value {
        match self.protocol {
            Protocol::OpenAi => json!({
                "error": {
                    "message": self.message,
                    "type": self.openai_type(),
                    "param": null,
                    "code": self.code
                }
            }),
            Protocol::Ollama => json!({
                "error": self.message,
                "code": self.code
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl From<kiln_core::Error> for ApiError {
    fn from(err: kiln_core::Error) -> Self {
        let status = match &err {
            kiln_core::Error::Validation(_) | kiln_core::Error::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            kiln_core::Error::ModelNotFound(_) => StatusCode::NOT_FOUND,
            kiln_core::Error::Capability(_) => StatusCode::FORBIDDEN,
            kiln_core::Error::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_maps_to_404_with_code() {
        let err = ApiError::from(kiln_core::Error::ModelNotFound("missing-model".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let body = err.body();
        assert_eq!(body["error"]["code"], "model_not_found");
        assert_eq!(body["error"]["type"], "not_found_error");
    }

    #[test]
    fn capability_maps_to_403() {
        let err = ApiError::ollama(kiln_core::Error::Capability("no embeddings".into()));
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        let body = err.body();
        assert!(body["error"].as_str().unwrap().contains("no embeddings"));
        assert_eq!(body["code"], "unsupported_operation");
    }

    #[test]
    fn generation_failure_is_server_error() {
        let err = ApiError::from(kiln_core::Error::generation("boom"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body()["error"]["type"], "server_error");
    }
}
