//! In-process adapter dispatching into an axum router.
//!
//! No socket is involved: the tunnel calls the router as a tower service.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use tower::ServiceExt;

use super::{LocalRequest, LocalResponse, LocalService, LocalServiceError};
use super::{collect_headers, is_forwardable};

/// Default cap on a buffered response body.
const DEFAULT_BODY_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RouterService {
    router: Router,
    body_limit: usize,
}

impl RouterService {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    #[must_use]
    pub const fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }
}

#[async_trait]
impl LocalService for RouterService {
    async fn call(&self, request: LocalRequest) -> Result<LocalResponse, LocalServiceError> {
        let mut builder = Request::builder()
            .method(request.method.as_str())
            .uri(request.path.as_str());
        for (name, value) in request.headers.iter() {
            if is_forwardable(name) {
                builder = builder.header(name, value);
            }
        }
        let body = request.body.map_or_else(Body::empty, Body::from);
        let http_request = builder
            .body(body)
            .map_err(|e| LocalServiceError::InvalidRequest(e.to_string()))?;

        let response = self
            .router
            .clone()
            .oneshot(http_request)
            .await
            .unwrap_or_else(|never| match never {});

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let bytes = axum::body::to_bytes(response.into_body(), self.body_limit)
            .await
            .map_err(|e| LocalServiceError::Handler(format!("failed to read response body: {e}")))?;

        Ok(LocalResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::{delete, get};

    use crate::tunnel::protocol::Headers;

    fn app() -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/yolo-models/{name}",
                delete(|Path(name): Path<String>| async move {
                    (axum::http::StatusCode::NO_CONTENT, [("x-deleted", name)])
                }),
            )
    }

    fn request(method: &str, path: &str) -> LocalRequest {
        LocalRequest {
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn dispatches_in_process() {
        let service = RouterService::new(app());
        let response = service.call(request("GET", "/health")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "ok");
    }

    #[tokio::test]
    async fn path_params_and_headers_survive() {
        let service = RouterService::new(app());
        let response = service
            .call(request("DELETE", "/yolo-models/coco"))
            .await
            .unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(response.headers.get("x-deleted"), Some("coco"));
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn invalid_uri_is_rejected() {
        let service = RouterService::new(app());
        let err = service.call(request("GET", "not a uri")).await.unwrap_err();
        assert!(matches!(err, LocalServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn oversized_body_is_handler_error() {
        let service = RouterService::new(app()).with_body_limit(1);
        let err = service.call(request("GET", "/health")).await.unwrap_err();
        assert!(matches!(err, LocalServiceError::Handler(_)));
    }
}
