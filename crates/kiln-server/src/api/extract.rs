//! JSON body extractors that reject with the protocol's error envelope.

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
};
use serde::de::DeserializeOwned;

use crate::error::{ApiError, Protocol};

/// JSON request body for `/v1` handlers.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

/// JSON request body for `/api` handlers.
#[derive(Debug)]
pub struct OllamaJson<T>(pub T);

async fn parse<T, S>(req: Request, state: &S, protocol: Protocol) -> Result<T, ApiError>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    match axum::Json::<T>::from_request(req, state).await {
        Ok(axum::Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::from(rejection).with_protocol(protocol)),
    }
}

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        parse(req, state, Protocol::OpenAi).await.map(Self)
    }
}

#[async_trait]
impl<T, S> FromRequest<S> for OllamaJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        parse(req, state, Protocol::Ollama).await.map(Self)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}
