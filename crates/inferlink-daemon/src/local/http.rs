//! Forwarding adapter for a Local Service listening on a local HTTP port.

use async_trait::async_trait;
use reqwest::Method;

use super::{LocalRequest, LocalResponse, LocalService, LocalServiceError};
use super::{collect_headers, is_forwardable};

/// Forwards relayed requests to `base_url` over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    http: reqwest::Client,
    base_url: String,
}

impl HttpForwarder {
    pub fn new(base_url: &str) -> Result<Self, LocalServiceError> {
        if base_url.is_empty() {
            return Err(LocalServiceError::Config("local service URL is empty".into()));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(LocalServiceError::Config(format!(
                "local service URL must be http(s): {base_url}"
            )));
        }

        crate::install_crypto_provider();
        // 3xx responses belong to the relay's caller.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    /// Build the absolute URL for a relayed path (route plus query string).
    pub(crate) fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

#[async_trait]
impl LocalService for HttpForwarder {
    async fn call(&self, request: LocalRequest) -> Result<LocalResponse, LocalServiceError> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            LocalServiceError::InvalidRequest(format!("invalid HTTP method {:?}", request.method))
        })?;

        let mut builder = self.http.request(method, self.url_for(&request.path));
        for (name, value) in request.headers.iter() {
            if is_forwardable(name) {
                builder = builder.header(name, value);
            }
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.text().await?;

        Ok(LocalResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::response::Redirect;
    use axum::routing::{get, post};

    use crate::tunnel::protocol::Headers;

    #[test]
    fn empty_base_url_returns_config_error() {
        let err = HttpForwarder::new("").unwrap_err();
        assert!(matches!(err, LocalServiceError::Config(_)));
    }

    #[test]
    fn non_http_base_url_returns_config_error() {
        let err = HttpForwarder::new("ws://127.0.0.1:8002").unwrap_err();
        assert!(matches!(err, LocalServiceError::Config(_)));
    }

    #[test]
    fn url_joins_path_and_query() {
        let forwarder = HttpForwarder::new("http://127.0.0.1:8002/").unwrap();
        assert_eq!(
            forwarder.url_for("/yolo-models?limit=5"),
            "http://127.0.0.1:8002/yolo-models?limit=5"
        );
        assert_eq!(forwarder.url_for("health"), "http://127.0.0.1:8002/health");
    }

    async fn spawn_local_app() -> String {
        let app = Router::new()
            .route(
                "/yolo-models",
                get(|| async { ([("content-type", "application/json")], "[]") }),
            )
            .route(
                "/yolo-models/",
                get(|| async { Redirect::temporary("/yolo-models") }),
            )
            .route(
                "/echo",
                post(|headers: HeaderMap, body: axum::body::Bytes| async move {
                    let marker = headers.contains_key("x-body-encoding");
                    format!("{}:{marker}", body.len())
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn forwards_get_and_returns_text_body() {
        let base = spawn_local_app().await;
        let forwarder = HttpForwarder::new(&base).unwrap();

        let response = forwarder
            .call(LocalRequest {
                method: "GET".into(),
                path: "/yolo-models".into(),
                headers: Headers::new(),
                body: None,
            })
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("content-type"), Some("application/json"));
        assert_eq!(response.body, "[]");
    }

    #[tokio::test]
    async fn forwards_raw_body_without_encoding_marker() {
        let base = spawn_local_app().await;
        let forwarder = HttpForwarder::new(&base).unwrap();

        let response = forwarder
            .call(LocalRequest {
                method: "POST".into(),
                path: "/echo".into(),
                headers: [("x-body-encoding", "base64")].into_iter().collect(),
                body: Some(vec![0, 159, 146, 150]),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "4:false");
    }

    #[tokio::test]
    async fn unknown_route_passes_status_through() {
        let base = spawn_local_app().await;
        let forwarder = HttpForwarder::new(&base).unwrap();

        let response = forwarder
            .call(LocalRequest {
                method: "DELETE".into(),
                path: "/missing".into(),
                headers: Headers::new(),
                body: None,
            })
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn invalid_method_is_rejected() {
        let forwarder = HttpForwarder::new("http://127.0.0.1:1").unwrap();
        let err = forwarder
            .call(LocalRequest {
                method: "GE T".into(),
                path: "/".into(),
                headers: Headers::new(),
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LocalServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unreachable_service_is_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = HttpForwarder::new(&format!("http://{addr}")).unwrap();
        let err = forwarder
            .call(LocalRequest {
                method: "GET".into(),
                path: "/".into(),
                headers: Headers::new(),
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LocalServiceError::Http(_)));
    }

    #[tokio::test]
    async fn redirect_is_returned_not_followed() {
        let base = spawn_local_app().await;
        let forwarder = HttpForwarder::new(&base).unwrap();

        let response = forwarder
            .call(LocalRequest {
                method: "GET".into(),
                path: "/yolo-models/".into(),
                headers: Headers::new(),
                body: None,
            })
            .await
            .unwrap();

        assert_eq!(response.status, 307);
        assert_eq!(response.headers.get("location"), Some("/yolo-models"));
        assert!(response.body.is_empty());
    }
}
