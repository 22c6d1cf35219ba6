//! Shared application state

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use vlm_core::{ServerConfig, VlmService};

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<VlmService>,
    /// Concurrency limiter to prevent resource exhaustion
    pub request_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn new(service: Arc<VlmService>, config: &ServerConfig) -> Self {
        Self {
            service,
            request_semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        }
    }

    /// Acquire a permit for the duration of a request handler.
    pub async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, ApiError> {
        self.request_semaphore
            .acquire()
            .await
            .map_err(|_| ApiError::service_unavailable("Server is shutting down"))
    }

    /// Acquire a permit that can travel with a response stream.
    pub async fn acquire_owned_permit(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        Arc::clone(&self.request_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ApiError::service_unavailable("Server is shutting down"))
    }
}
