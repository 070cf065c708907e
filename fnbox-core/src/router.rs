// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Invocation router.
//!
//! Turns `/{userId}/{handler}/{engine}` plus query and body into an
//! [`InvocationRequest`], resolves the function and hands it to the
//! [`LifecycleManager`] on a detached task. Every outcome becomes a
//! [`RouterResponse`] with an HTTP status and a JSON body.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::collector::InvocationMetrics;
use crate::error::InvocationError;
use crate::lifecycle::{InvocationReport, LifecycleManager};
use crate::registry::FunctionResolver;
use crate::types::{EngineKind, HandlerName, UserId};

/// A parsed invocation request.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub user_id: UserId,
    pub handler: HandlerName,
    pub engine: EngineKind,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
}

/// HTTP-shaped answer to one request.
#[derive(Debug, Clone)]
pub struct RouterResponse {
    pub status: u16,
    pub body: Value,
    /// Seconds for a `Retry-After` header.
    pub retry_after: Option<u64>,
    /// Present when a sandbox lifecycle actually ran.
    pub metrics: Option<InvocationMetrics>,
    pub error_kind: Option<&'static str>,
}

impl RouterResponse {
    /// Error envelope: `{error, message, stderr?}`.
    pub fn from_error(error: &InvocationError) -> Self {
        let mut body = json!({
            "error": error.kind(),
            "message": error.to_string(),
        });
        if let InvocationError::Runtime { stderr, .. } = error {
            if !stderr.is_empty() {
                body["stderr"] = Value::String(stderr.clone());
            }
        }

        Self {
            status: error.status_code(),
            body,
            retry_after: matches!(error, InvocationError::ResourceExhausted { .. }).then_some(1),
            metrics: None,
            error_kind: Some(error.kind()),
        }
    }

    fn with_metrics(mut self, metrics: InvocationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Parse `/{userId}/{handler}/{engine}`; one trailing `/` is tolerated.
pub fn parse_path(path: &str) -> Result<(UserId, HandlerName, EngineKind), InvocationError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    let segments: Vec<&str> = trimmed.split('/').collect();

    let [user, handler, engine] = segments.as_slice() else {
        return Err(InvocationError::validation(format!(
            "expected /{{userId}}/{{handler}}/{{engine}}, got {:?}",
            path
        )));
    };

    if segments.iter().any(|s| s.is_empty()) {
        return Err(InvocationError::validation(format!(
            "empty path segment in {:?}",
            path
        )));
    }

    let engine = EngineKind::from_selector(engine).ok_or_else(|| {
        InvocationError::validation(format!(
            "unknown engine {:?}, expected one of: {}",
            engine,
            EngineKind::ALL.map(|e| e.selector()).join(", ")
        ))
    })?;

    // Names that cannot be registered resolve to nothing
    let not_found = || InvocationError::NotFound {
        user_id: user.to_string(),
        handler: handler.to_string(),
    };
    let user_id = UserId::new(*user).map_err(|_| not_found())?;
    let handler = HandlerName::new(*handler).map_err(|_| not_found())?;

    Ok((user_id, handler, engine))
}

/// Assemble the handler event from query parameters and the request body.
///
/// Body keys win over query keys. A repeated query key keeps its last value.
pub fn build_event(query: &[(String, String)], body: &[u8]) -> Value {
    let mut event = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            Ok(other) => Map::from_iter([("body".to_string(), other)]),
            Err(_) => Map::from_iter([(
                "body".to_string(),
                Value::String(String::from_utf8_lossy(body).into_owned()),
            )]),
        }
    };

    let mut params = Map::new();
    for (key, value) in query {
        params.insert(key.clone(), Value::String(value.clone()));
    }
    for (key, value) in params {
        event.entry(key).or_insert(value);
    }

    Value::Object(event)
}

/// Front door of the engine.
#[derive(Clone)]
pub struct InvocationRouter {
    resolver: Arc<dyn FunctionResolver>,
    manager: Arc<LifecycleManager>,
}

impl InvocationRouter {
    pub fn new(resolver: Arc<dyn FunctionResolver>, manager: Arc<LifecycleManager>) -> Self {
        Self { resolver, manager }
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// Handle one HTTP invocation. Never fails; errors become envelopes.
    pub async fn handle(
        &self,
        path: &str,
        query: Vec<(String, String)>,
        body: Bytes,
    ) -> RouterResponse {
        let (user_id, handler, engine) = match parse_path(path) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "Rejected invocation path");
                return RouterResponse::from_error(&e);
            }
        };

        let request = InvocationRequest {
            user_id,
            handler,
            engine,
            query,
            body,
        };

        match self.invoke(request).await {
            Ok(report) => match report.result {
                Ok(result) => RouterResponse {
                    status: result.status_code,
                    body: result.body,
                    retry_after: None,
                    metrics: Some(report.metrics),
                    error_kind: None,
                },
                Err(e) => RouterResponse::from_error(&e).with_metrics(report.metrics),
            },
            Err(e) => RouterResponse::from_error(&e),
        }
    }

    /// Resolve and run `request`.
    ///
    /// The lifecycle runs on its own task, so dropping this future leaves the
    /// invocation running to its deadline and teardown.
    pub async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationReport, InvocationError> {
        let metadata = self
            .resolver
            .lookup(&request.user_id, &request.handler)
            .await?;
        let event = build_event(&request.query, &request.body);
        let manager = Arc::clone(&self.manager);
        let engine = request.engine;

        tokio::spawn(async move { manager.invoke(&metadata, engine, event).await })
            .await
            .map_err(|e| InvocationError::runtime(format!("invocation task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_path() {
        let (user, handler, engine) = parse_path("/u1/main.run/docker").unwrap();
        assert_eq!(user.as_str(), "u1");
        assert_eq!(handler.as_str(), "main.run");
        assert_eq!(engine, EngineKind::Container);

        let (_, _, engine) = parse_path("/u1/main.run/nanos/").unwrap();
        assert_eq!(engine, EngineKind::Unikernel);
    }

    #[test]
    fn test_parse_path_rejects_bad_shapes() {
        for path in [
            "/u1/main.run",
            "/u1/main.run/docker/extra",
            "/u1/main.run/firecracker",
            "//main.run/docker",
            "/u1//docker",
            "",
        ] {
            let err = parse_path(path).unwrap_err();
            assert_eq!(err.status_code(), 400, "path {path:?}");
        }
    }

    #[test]
    fn test_unregistrable_names_are_not_found() {
        for path in ["/u1/hello/nanos", "/user@example.com/main.run/docker"] {
            let err = parse_path(path).unwrap_err();
            assert_eq!(err.status_code(), 404, "path {path:?}");
            assert_eq!(err.kind(), "NotFoundError");
        }
    }

    #[test]
    fn test_event_from_query_only() {
        let event = build_event(&q(&[("name", "ada"), ("n", "1")]), b"");
        assert_eq!(event, json!({"name": "ada", "n": "1"}));
    }

    #[test]
    fn test_body_wins_over_query() {
        let event = build_event(&q(&[("a", "query"), ("b", "2")]), br#"{"a": 1}"#);
        assert_eq!(event, json!({"a": 1, "b": "2"}));
    }

    #[test]
    fn test_non_object_bodies_wrapped() {
        assert_eq!(build_event(&[], b"[1,2]"), json!({"body": [1, 2]}));
        assert_eq!(
            build_event(&q(&[("x", "y")]), b"plain text"),
            json!({"body": "plain text", "x": "y"})
        );
    }

    #[test]
    fn test_repeated_query_key_keeps_last() {
        let event = build_event(&q(&[("k", "1"), ("k", "2")]), b"  ");
        assert_eq!(event, json!({"k": "2"}));
    }

    #[test]
    fn test_error_envelope() {
        let response = RouterResponse::from_error(&InvocationError::Runtime {
            message: "handler exited with status 1".to_string(),
            stdout: String::new(),
            stderr: "Traceback".to_string(),
        });
        assert_eq!(response.status, 500);
        assert_eq!(response.body["error"], "RuntimeError");
        assert_eq!(response.body["stderr"], "Traceback");
        assert_eq!(response.retry_after, None);

        let busy = RouterResponse::from_error(&InvocationError::ResourceExhausted { capacity: 4 });
        assert_eq!(busy.status, 503);
        assert_eq!(busy.retry_after, Some(1));
        assert!(busy.body.get("stderr").is_none());
    }
}
