// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Execution backends.
//!
//! Every backend implements the same capability set: `prepare` a sandbox from
//! an artifact, `invoke` the handler once, `terminate` it when the deadline
//! passes, and `teardown` the sandbox. The lifecycle manager picks a backend
//! per invocation through [`BackendSet::select`].

pub mod bootstrap;
pub mod container;
pub mod process;
pub mod unikernel;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::error::InvocationError;
use crate::registry::FunctionMetadata;
use crate::types::{EngineKind, MemoryLimit, SandboxId, TimeoutSecs};

pub use container::ContainerBackend;
pub use unikernel::UnikernelBackend;

/// Memory and time ceilings of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory: MemoryLimit,
    pub timeout: TimeoutSecs,
}

/// Ephemeral per-invocation context. Never outlives the invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub sandbox_id: SandboxId,
    pub engine: EngineKind,
    /// Fixed at invocation start.
    pub deadline: Instant,
    /// The same deadline as wall-clock milliseconds, for the handler.
    pub deadline_unix_ms: u64,
    pub limits: ResourceLimits,
    pub workdir: PathBuf,
    pub function_id: String,
    pub handler: String,
}

impl InvocationContext {
    /// Build the context for `metadata`, computing the deadline from `started`.
    pub fn new(
        sandbox_id: SandboxId,
        engine: EngineKind,
        metadata: &FunctionMetadata,
        started: Instant,
        work_root: &Path,
    ) -> Self {
        let timeout = metadata.timeout.as_duration();
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        // `started` may lie slightly in the past
        let remaining = timeout.saturating_sub(started.elapsed());

        Self {
            workdir: work_root.join(sandbox_id.as_str()),
            sandbox_id,
            engine,
            deadline: started + timeout,
            deadline_unix_ms: now_ms + remaining.as_millis() as u64,
            limits: ResourceLimits {
                memory: metadata.memory,
                timeout: metadata.timeout,
            },
            function_id: metadata.id.clone(),
            handler: metadata.handler.to_string(),
        }
    }

    /// The `context` object handed to the user handler.
    pub fn handler_context(&self) -> Value {
        json!({
            "functionId": self.function_id,
            "functionName": self.handler,
            "sandboxId": self.sandbox_id.as_str(),
            "engine": self.engine.name(),
            "memoryLimitInMB": self.limits.memory.megabytes(),
            "timeoutSeconds": self.limits.timeout.secs(),
            "deadlineMs": self.deadline_unix_ms,
        })
    }
}

/// Serialized `{event, context}` document read by the runtime bootstrap.
pub fn invocation_payload(event: &Value, ctx: &InvocationContext) -> Vec<u8> {
    let doc = json!({
        "event": event,
        "context": ctx.handler_context(),
    });
    // Serializing a `Value` cannot fail
    serde_json::to_vec(&doc).unwrap_or_default()
}

/// Backend-specific resources held by a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxResource {
    Container { name: String, image: String },
    Vm { instance: String, package: String },
    /// A bare host process, used by test and development backends.
    Process,
}

/// Process id of the host-side sandbox driver while it runs. 0 means none.
#[derive(Debug, Default)]
pub struct ProcessSlot(AtomicU32);

impl ProcessSlot {
    pub fn set(&self, pid: u32) {
        self.0.store(pid, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<u32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Exclusive handle to one sandbox.
///
/// Deliberately neither `Clone` nor `Copy`: `teardown` consumes it, so a
/// handle can be torn down at most once.
#[derive(Debug)]
pub struct SandboxHandle {
    id: SandboxId,
    engine: EngineKind,
    resource: SandboxResource,
    workdir: PathBuf,
    cold_start: bool,
    process: ProcessSlot,
}

impl SandboxHandle {
    pub fn new(
        id: SandboxId,
        engine: EngineKind,
        resource: SandboxResource,
        workdir: PathBuf,
        cold_start: bool,
    ) -> Self {
        Self {
            id,
            engine,
            resource,
            workdir,
            cold_start,
            process: ProcessSlot::default(),
        }
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn resource(&self) -> &SandboxResource {
        &self.resource
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Whether `prepare` had to build the image/template for this sandbox.
    pub fn cold_start(&self) -> bool {
        self.cold_start
    }

    pub fn process(&self) -> &ProcessSlot {
        &self.process
    }
}

/// Strength of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Ask the sandbox to stop (SIGTERM, ACPI power-down).
    Graceful,
    /// Stop it now (SIGKILL, power-off).
    Forced,
}

/// Unprocessed output of one handler run.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the driver was killed by a signal.
    pub exit_code: Option<i32>,
    /// Time from process start to the bootstrap's boot marker.
    pub boot_latency: Option<Duration>,
    /// Wall clock from invoke start to process exit.
    pub elapsed: Duration,
    pub truncated: bool,
}

/// Capability interface shared by all execution backends.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Build or reuse an image/template and allocate a sandbox.
    /// Does not run user code. Must release anything it allocated on failure.
    async fn prepare(
        &self,
        metadata: &FunctionMetadata,
        artifact: Bytes,
        ctx: &InvocationContext,
    ) -> Result<SandboxHandle, InvocationError>;

    /// Run the handler once and wait for it to exit.
    async fn invoke(
        &self,
        handle: &SandboxHandle,
        event: &Value,
        ctx: &InvocationContext,
        deadline: Instant,
    ) -> Result<RawOutput, InvocationError>;

    /// Signal a running invocation to stop.
    async fn terminate(&self, handle: &SandboxHandle, mode: Termination);

    /// Release every resource of the sandbox. Never fails; problems are logged.
    async fn teardown(&self, handle: SandboxHandle);
}

/// One backend per [`EngineKind`].
#[derive(Clone)]
pub struct BackendSet {
    container: Arc<dyn ExecutionBackend>,
    unikernel: Arc<dyn ExecutionBackend>,
}

impl BackendSet {
    pub fn new(container: Arc<dyn ExecutionBackend>, unikernel: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            container,
            unikernel,
        }
    }

    pub fn select(&self, engine: EngineKind) -> &Arc<dyn ExecutionBackend> {
        match engine {
            EngineKind::Container => &self.container,
            EngineKind::Unikernel => &self.unikernel,
        }
    }
}

/// Remove a sandbox workdir, tolerating its absence.
pub(crate) async fn remove_workdir(sandbox_id: &SandboxId, workdir: &Path) {
    match tokio::fs::remove_dir_all(workdir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            sandbox_id = %sandbox_id,
            workdir = %workdir.display(),
            error = %e,
            "Failed to remove sandbox workdir"
        ),
    }
}
