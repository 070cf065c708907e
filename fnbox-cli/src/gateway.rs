// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! HTTP Gateway for fnbox.
//!
//! Serves `GET|POST /api/function/{userId}/{handler}/{engine}` and hands each
//! request to the [`InvocationRouter`]. The router runs the invocation on its
//! own task, so a client that disconnects does not cut a sandbox short.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

use fnbox_core::{InvocationError, InvocationRouter, RouterResponse};

use crate::metrics;

/// Gateway state shared across threads
#[derive(Clone)]
struct GatewayState {
    router: InvocationRouter,
}

pub fn app(router: InvocationRouter) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/function/{*rest}", get(invoke).post(invoke))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(GatewayState { router })
}

pub async fn start_gateway(
    port: u16,
    router: InvocationRouter,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(router)).await?;

    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn invoke(
    State(state): State<GatewayState>,
    Path(rest): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let response = state.router.handle(&rest, query, body).await;
    metrics::record(&response);
    into_http(response)
}

/// Anything under `/api/function` that did not match is a malformed path.
async fn fallback(uri: Uri) -> Response {
    if !uri.path().starts_with("/api/function") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let response = RouterResponse::from_error(&InvocationError::Validation {
        message: format!(
            "expected /api/function/{{userId}}/{{handler}}/{{engine}}, got {}",
            uri.path()
        ),
    });
    metrics::record(&response);
    into_http(response)
}

fn into_http(response: RouterResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = (status, Json(response.body)).into_response();
    if let Some(secs) = response.retry_after {
        http.headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    http
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_header() {
        let http = into_http(RouterResponse::from_error(
            &InvocationError::ResourceExhausted { capacity: 2 },
        ));
        assert_eq!(http.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    fn empty_app() -> Router {
        let config = fnbox_core::ConfigLoader::load_string("{}").unwrap();
        let registry = fnbox_core::FunctionRegistry::new_shared();
        let manager =
            std::sync::Arc::new(fnbox_core::LifecycleManager::from_config(&config).unwrap());
        app(InvocationRouter::new(registry, manager))
    }

    async fn send(uri: &str) -> (StatusCode, serde_json::Value) {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = empty_app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = send("/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unregistered_function_is_404() {
        let (status, body) = send("/api/function/u1/main.run/docker?x=1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFoundError");
    }

    #[tokio::test]
    async fn test_malformed_paths_are_400() {
        for uri in ["/api/function/u1/main.run", "/api/function/u1/main.run/vmware"] {
            let (status, body) = send(uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "uri {uri}");
            assert_eq!(body["error"], "ValidationError");
        }

        let (status, _) = send("/somewhere/else").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_handler_status_passed_through() {
        let http = into_http(RouterResponse {
            status: 201,
            body: json!("created"),
            retry_after: None,
            metrics: None,
            error_kind: None,
        });
        assert_eq!(http.status(), StatusCode::CREATED);
    }
}
