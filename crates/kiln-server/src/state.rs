//! Application state management with high-concurrency optimizations

use std::sync::Arc;
use std::time::Duration;

use kiln_core::catalog::remote::RemoteCatalog;
use kiln_core::{BackendDescriptor, CompletionDispatcher};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ApiError;

/// Shared application state with backpressure
#[derive(Clone)]
pub struct AppState {
    /// Catalog, engine registry and generation defaults
    pub dispatcher: CompletionDispatcher,
    /// Remote artifact listing for the admin namespace
    pub remote: RemoteCatalog,
    /// Concurrency limiter to prevent resource exhaustion
    pub request_semaphore: Arc<Semaphore>,
    /// Request timeout configuration (seconds)
    pub request_timeout_secs: u64,
}

impl AppState {
    pub fn new(dispatcher: CompletionDispatcher, remote: RemoteCatalog) -> Self {
        // Default: 100 concurrent requests (tunable based on hardware)
        let max_concurrent = std::env::var("MAX_CONCURRENT_REQUESTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let timeout = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300); // 5 minutes default

        Self::with_limits(dispatcher, remote, max_concurrent, timeout)
    }

    pub fn with_limits(
        dispatcher: CompletionDispatcher,
        remote: RemoteCatalog,
        max_concurrent: usize,
        request_timeout_secs: u64,
    ) -> Self {
        Self {
            dispatcher,
            remote,
            request_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            request_timeout_secs,
        }
    }

    pub fn backend(&self) -> &BackendDescriptor {
        self.dispatcher.registry().backend()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Acquire a permit for concurrent request processing. The permit is
    /// owned so a streaming body can hold it until the client is done.
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        self.request_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiError::internal("Server is shutting down"))
    }
}
