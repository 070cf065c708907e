// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end integration tests for fnbox.
//!
//! These tests drive the router from configuration through the lifecycle
//! manager to a real Python handler. The sandbox is a plain local process
//! running the same bootstrap the container and unikernel images use.

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::Instant;

use fnbox_core::backend::{bootstrap, process, SandboxResource, Termination};
use fnbox_core::{
    BackendSet, CodeCache, CodeFetcher, ConfigLoader, DirectoryFetcher, EngineKind,
    ExecutionBackend, FetchError, FunctionMetadata, FunctionRegistry, InvocationContext,
    InvocationError, InvocationRouter, LifecycleManager, RawOutput, SandboxHandle, StorageKey,
};

fn python3_available() -> bool {
    StdCommand::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Runs the staged bootstrap with the host's python3.
struct LocalProcessBackend {
    torn_down: AtomicUsize,
}

impl LocalProcessBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            torn_down: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Container
    }

    async fn prepare(
        &self,
        metadata: &FunctionMetadata,
        artifact: Bytes,
        ctx: &InvocationContext,
    ) -> Result<SandboxHandle, InvocationError> {
        bootstrap::stage(&ctx.workdir, metadata, &artifact)
            .await
            .map_err(|e| InvocationError::Provisioning {
                message: e.to_string(),
            })?;
        Ok(SandboxHandle::new(
            ctx.sandbox_id.clone(),
            ctx.engine,
            SandboxResource::Process,
            ctx.workdir.clone(),
            false,
        ))
    }

    async fn invoke(
        &self,
        handle: &SandboxHandle,
        event: &Value,
        ctx: &InvocationContext,
        _deadline: Instant,
    ) -> Result<RawOutput, InvocationError> {
        let (entry_name, _) = bootstrap::entrypoint(fnbox_core::Runtime::Python);
        let mut command = Command::new("python3");
        command
            .arg(handle.workdir().join(entry_name))
            .env("FNBOX_HANDLER", &ctx.handler)
            .env("FNBOX_CODE_DIR", handle.workdir().join(bootstrap::CODE_DIR));

        let payload = fnbox_core::backend::invocation_payload(event, ctx);
        process::run(command, Some(payload), handle.process(), 64 * 1024)
            .await
            .map_err(|e| InvocationError::Provisioning {
                message: e.to_string(),
            })
    }

    async fn terminate(&self, handle: &SandboxHandle, mode: Termination) {
        process::signal_group(handle.process(), mode);
    }

    async fn teardown(&self, handle: SandboxHandle) {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        let _ = tokio::fs::remove_dir_all(handle.workdir()).await;
    }
}

/// Counts fetches and answers slowly so concurrent misses overlap.
struct CountingFetcher {
    inner: DirectoryFetcher,
    fetches: AtomicUsize,
}

#[async_trait]
impl CodeFetcher for CountingFetcher {
    async fn fetch(&self, key: &StorageKey) -> Result<Bytes, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.fetch(key).await
    }
}

struct Fixture {
    _dir: TempDir,
    work_dir: PathBuf,
    router: InvocationRouter,
    backend: Arc<LocalProcessBackend>,
    fetcher: Arc<CountingFetcher>,
}

const HANDLERS: &[(&str, &str)] = &[
    (
        "echo.py",
        r#"
def handler(event, context):
    print("echo called")
    return {"statusCode": 200, "body": {"event": event, "sandbox": context["sandboxId"]}}
"#,
    ),
    (
        "greet.py",
        r#"
def handler(event, context):
    return {"body": "hi " + event.get("name", "world")}
"#,
    ),
    (
        "crash.py",
        r#"
import sys
def handler(event, context):
    sys.stderr.write("about to fail\n")
    raise ValueError("bad input")
"#,
    ),
    (
        "slow.py",
        r#"
import time
def handler(event, context):
    time.sleep(30)
    return {"body": "too late"}
"#,
    ),
];

fn fixture(capacity: usize) -> Fixture {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let functions = dir.path().join("functions");
    let work_dir = dir.path().join("work");
    std::fs::create_dir_all(functions.join("u1")).unwrap();
    std::fs::create_dir_all(&work_dir).unwrap();
    for (name, source) in HANDLERS {
        std::fs::write(functions.join("u1").join(name), source).unwrap();
    }

    let yaml = format!(
        r#"
engine:
  work_dir: {work}
  max_concurrent_provisions: {capacity}
  termination_grace_ms: 200
  kill_grace_ms: 200
code_source:
  directory: {functions}
functions:
  - user_id: u1
    handler: echo.handler
    runtime: python
    storage_key: u1/echo.py
  - user_id: u1
    handler: greet.handler
    runtime: python
    storage_key: u1/greet.py
  - user_id: u1
    handler: crash.handler
    runtime: python
    storage_key: u1/crash.py
  - user_id: u1
    handler: slow.handler
    runtime: python
    timeout_seconds: 1
    storage_key: u1/slow.py
"#,
        work = work_dir.display(),
        functions = functions.display(),
    );
    let config = ConfigLoader::load_string(&yaml).expect("Config should be valid");

    let backend = LocalProcessBackend::new();
    let fetcher = Arc::new(CountingFetcher {
        inner: DirectoryFetcher::new(functions),
        fetches: AtomicUsize::new(0),
    });
    let cache = Arc::new(CodeCache::new(
        fetcher.clone(),
        config.engine.code_cache_entries,
    ));
    let manager = Arc::new(LifecycleManager::new(
        BackendSet::new(backend.clone(), backend.clone()),
        cache,
        config.engine.clone(),
    ));
    let registry = Arc::new(FunctionRegistry::from_functions(config.functions).unwrap());

    Fixture {
        _dir: dir,
        work_dir,
        router: InvocationRouter::new(registry, manager),
        backend,
        fetcher,
    }
}

fn workdir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

#[tokio::test]
async fn test_event_round_trip() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = fixture(4);

    let response = fx
        .router
        .handle(
            "/u1/echo.handler/docker",
            vec![("q".to_string(), "x".to_string())],
            Bytes::from_static(br#"{"a": 1}"#),
        )
        .await;

    assert_eq!(response.status, 200, "body: {}", response.body);
    assert_eq!(response.body["event"], json!({"a": 1, "q": "x"}));
    let metrics = response.metrics.expect("metrics for a run sandbox");
    assert_eq!(response.body["sandbox"], metrics.sandbox_id);
    assert!(metrics.boot_ms.is_some());
    assert_eq!(fx.backend.torn_down.load(Ordering::SeqCst), 1);
    assert!(workdir_is_empty(&fx.work_dir));
}

#[tokio::test]
async fn test_defaults_for_missing_status() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = fixture(4);

    let response = fx
        .router
        .handle(
            "/u1/greet.handler/nanos",
            vec![("name".to_string(), "ada".to_string())],
            Bytes::new(),
        )
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!("hi ada"));
}

#[tokio::test]
async fn test_handler_exception_is_500_with_stderr() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = fixture(4);

    let response = fx
        .router
        .handle("/u1/crash.handler/docker", Vec::new(), Bytes::new())
        .await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body["error"], "RuntimeError");
    let stderr = response.body["stderr"].as_str().unwrap_or_default();
    assert!(stderr.contains("about to fail"), "stderr: {stderr}");
    assert!(stderr.contains("ValueError"), "stderr: {stderr}");
    assert_eq!(fx.backend.torn_down.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_kills_handler() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = fixture(4);

    let started = std::time::Instant::now();
    let response = fx
        .router
        .handle("/u1/slow.handler/docker", Vec::new(), Bytes::new())
        .await;

    assert_eq!(response.status, 504);
    assert_eq!(response.body["error"], "TimeoutError");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(fx.backend.torn_down.load(Ordering::SeqCst), 1);
    assert!(workdir_is_empty(&fx.work_dir));
}

#[tokio::test]
async fn test_concurrent_invocations_are_isolated() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = fixture(16);

    let calls = (0..8).map(|i| {
        let router = fx.router.clone();
        async move {
            let body = Bytes::from(json!({ "n": i }).to_string());
            router.handle("/u1/echo.handler/docker", Vec::new(), body).await
        }
    });
    let responses = futures::future::join_all(calls).await;

    let mut sandboxes = std::collections::HashSet::new();
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.status, 200);
        assert_eq!(response.body["event"]["n"], i);
        sandboxes.insert(response.body["sandbox"].as_str().unwrap().to_string());
    }
    assert_eq!(sandboxes.len(), 8);
    assert_eq!(fx.backend.torn_down.load(Ordering::SeqCst), 8);
    assert_eq!(fx.fetcher.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_function_and_bad_path() {
    let fx = fixture(4);

    let missing = fx
        .router
        .handle("/u2/echo.handler/docker", Vec::new(), Bytes::new())
        .await;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body["error"], "NotFoundError");

    let no_such_handler = fx
        .router
        .handle("/u1/hello/nanos", Vec::new(), Bytes::new())
        .await;
    assert_eq!(no_such_handler.status, 404);

    let bad_engine = fx
        .router
        .handle("/u1/echo.handler/qemu", Vec::new(), Bytes::new())
        .await;
    assert_eq!(bad_engine.status, 400);
    assert_eq!(fx.backend.torn_down.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_cache_misses_fetch_once() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("calc.py"), "def run(e, c): return {}").unwrap();
    let fetcher = Arc::new(CountingFetcher {
        inner: DirectoryFetcher::new(dir.path()),
        fetches: AtomicUsize::new(0),
    });
    let cache = Arc::new(CodeCache::new(fetcher.clone(), 0));
    let key = StorageKey::new("calc.py").unwrap();

    let gets = (0..20).map(|_| {
        let cache = Arc::clone(&cache);
        let key = key.clone();
        tokio::spawn(async move { cache.get(&key).await })
    });
    for result in futures::future::join_all(gets).await {
        let bytes = result.unwrap().unwrap();
        assert!(bytes.starts_with(b"def run"));
    }
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    let missing = StorageKey::new("nope.py").unwrap();
    assert!(matches!(
        cache.get(&missing).await,
        Err(FetchError::NotFound { .. })
    ));
}

#[test]
fn test_config_file_loading() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fnbox.yaml");
    std::fs::write(
        &path,
        r#"
server:
  listen_port: 8080
  metrics_port: 9100
functions:
  - user_id: u1
    handler: calc.run
    runtime: nodejs
    memory_mb: 256
    storage_key: u1/calc.js
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_file(&path).unwrap();
    assert_eq!(config.functions.len(), 1);
    assert_eq!(config.functions[0].memory.megabytes(), 256);

    assert!(ConfigLoader::load_file(dir.path().join("missing.yaml")).is_err());
}
