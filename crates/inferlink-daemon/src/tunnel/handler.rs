//! Dispatches relayed requests into the Local Service.
//!
//! Every request handed to [`TunnelRequestHandler::dispatch`] yields exactly
//! one response envelope with the request's `id`. Failures of any kind
//! (body decoding, the service returning an error, a timeout or a panic)
//! become a status-500 envelope.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::FutureExt as _;
use tracing::{debug, error, warn};

use crate::local::{LocalRequest, LocalResponse, LocalService, LocalServiceError};

use super::protocol::{CorrelationId, RequestEnvelope, ResponseEnvelope};

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("failed to decode base64 body: {0}")]
    Body(#[from] base64::DecodeError),

    #[error(transparent)]
    Service(#[from] LocalServiceError),

    #[error("local service did not respond within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("local service panicked: {0}")]
    Panicked(String),
}

/// Stateless adapter between request envelopes and the Local Service.
pub struct TunnelRequestHandler {
    service: Arc<dyn LocalService>,
    request_timeout: Option<Duration>,
}

impl TunnelRequestHandler {
    pub fn new(service: Arc<dyn LocalService>) -> Self {
        Self {
            service,
            request_timeout: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Handle one request. Never fails.
    pub async fn dispatch(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let id = request.id.clone();
        let method = request.method.clone();
        let path = request.path.clone();

        match self.try_dispatch(request).await {
            Ok(local) => {
                debug!(request_id = %id, %method, %path, status = local.status, "Request handled");
                ResponseEnvelope {
                    id,
                    status: local.status,
                    headers: local.headers,
                    body: local.body,
                }
            }
            Err(e) => {
                error!(request_id = %id, %method, %path, error = %e, "Error handling request");
                ResponseEnvelope::internal_error(id, &e.to_string())
            }
        }
    }

    /// Answer a frame that carried an `id` but could not be parsed.
    pub fn reject(id: CorrelationId, reason: &str) -> ResponseEnvelope {
        warn!(request_id = %id, reason, "Rejecting unparseable request");
        ResponseEnvelope::internal_error(id, reason)
    }

    async fn try_dispatch(&self, request: RequestEnvelope) -> Result<LocalResponse, DispatchError> {
        let body = decode_body(&request)?;
        let local_request = LocalRequest {
            method: request.method,
            path: request.path,
            headers: request.headers,
            body,
        };

        let call = AssertUnwindSafe(self.service.call(local_request)).catch_unwind();
        let outcome = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| DispatchError::Timeout(limit))?,
            None => call.await,
        };

        match outcome {
            Ok(result) => Ok(result?),
            Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

/// Raw body bytes for the Local Service. Empty bodies are treated as absent.
fn decode_body(request: &RequestEnvelope) -> Result<Option<Vec<u8>>, DispatchError> {
    match request.body.as_deref() {
        None | Some("") => Ok(None),
        Some(body) if request.has_binary_body() => Ok(Some(STANDARD.decode(body)?)),
        Some(body) => Ok(Some(body.as_bytes().to_vec())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::significant_drop_tightening,
    clippy::items_after_statements
)]
#[path = "handler_tests.rs"]
mod tests;
