// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lifecycle manager.
//!
//! Drives one invocation through its state machine:
//!
//! ```text
//! Created → Provisioning → Running → {Completed | TimedOut | Failed} → TornDown
//! ```
//!
//! The deadline is fixed when the invocation starts and covers fetching,
//! provisioning and execution. When it passes the sandbox is asked to stop,
//! then killed, then abandoned; in every case the handle is torn down
//! exactly once.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::time::{timeout, timeout_at, Instant};

use crate::backend::{
    BackendSet, ContainerBackend, ExecutionBackend, InvocationContext, RawOutput, SandboxHandle,
    Termination, UnikernelBackend,
};
use crate::cache::CodeCache;
use crate::collector::{ExecutionResult, InvocationMetrics, Outcome, ResultCollector};
use crate::config::{Config, EngineConfig};
use crate::error::{FnboxError, FnboxResult, InvocationError};
use crate::fetcher;
use crate::limiter::ProvisioningLimiter;
use crate::registry::FunctionMetadata;
use crate::state::{InvocationState, InvocationStateMachine, StateMachineMetrics};
use crate::types::{EngineKind, SandboxId};

/// Upper bound for one `terminate` call.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for one `teardown` call.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything known about a finished invocation.
#[derive(Debug)]
pub struct InvocationReport {
    pub sandbox_id: SandboxId,
    pub result: Result<ExecutionResult, InvocationError>,
    pub metrics: InvocationMetrics,
    pub lifecycle: StateMachineMetrics,
}

/// What came out of the Running state.
struct Execution {
    outcome: Outcome,
    raw: Option<RawOutput>,
    error: Option<InvocationError>,
}

impl Execution {
    fn failed(error: InvocationError) -> Self {
        let outcome = match error {
            InvocationError::Timeout { .. } => Outcome::TimedOut,
            _ => Outcome::Failed,
        };
        Self {
            outcome,
            raw: None,
            error: Some(error),
        }
    }
}

fn outcome_state(outcome: Outcome) -> InvocationState {
    match outcome {
        Outcome::Completed => InvocationState::Completed,
        Outcome::TimedOut => InvocationState::TimedOut,
        Outcome::Failed => InvocationState::Failed,
    }
}

fn advance(machine: &mut InvocationStateMachine, target: InvocationState) {
    if let Err(e) = machine.transition_to(target) {
        tracing::error!(error = %e, "Invocation state machine rejected transition");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs invocations against the configured backends.
pub struct LifecycleManager {
    backends: BackendSet,
    cache: Arc<CodeCache>,
    limiter: ProvisioningLimiter,
    collector: ResultCollector,
    config: EngineConfig,
}

impl LifecycleManager {
    pub fn new(backends: BackendSet, cache: Arc<CodeCache>, config: EngineConfig) -> Self {
        Self {
            backends,
            cache,
            limiter: ProvisioningLimiter::new(config.max_concurrent_provisions),
            collector: ResultCollector::new(config.stderr_excerpt_bytes),
            config,
        }
    }

    /// Wire up the Docker and Nanos backends and the artifact cache.
    pub fn from_config(config: &Config) -> FnboxResult<Self> {
        let fetcher = fetcher::from_source(&config.code_source).map_err(|e| {
            FnboxError::ConfigParse {
                message: format!("code_source: {}", e),
            }
        })?;
        let cache = Arc::new(CodeCache::new(fetcher, config.engine.code_cache_entries));

        let backends = BackendSet::new(
            Arc::new(ContainerBackend::new(
                config.container.clone(),
                &config.engine,
            )),
            Arc::new(UnikernelBackend::new(
                config.unikernel.clone(),
                &config.engine,
            )),
        );

        Ok(Self::new(backends, cache, config.engine.clone()))
    }

    pub fn limiter(&self) -> &ProvisioningLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Run `metadata`'s handler once on `engine` with `event`.
    ///
    /// Never panics and never leaks the sandbox: the report always describes
    /// a torn-down invocation.
    pub async fn invoke(
        &self,
        metadata: &FunctionMetadata,
        engine: EngineKind,
        event: Value,
    ) -> InvocationReport {
        let started = Instant::now();
        let sandbox_id = SandboxId::generate(engine);
        let ctx = InvocationContext::new(
            sandbox_id.clone(),
            engine,
            metadata,
            started,
            &self.config.work_dir,
        );
        let backend = Arc::clone(self.backends.select(engine));
        let mut machine = InvocationStateMachine::new(sandbox_id.clone());

        tracing::debug!(
            sandbox_id = %sandbox_id,
            function = %metadata.id,
            engine = %engine,
            timeout_secs = metadata.timeout.secs(),
            "Invocation accepted"
        );

        advance(&mut machine, InvocationState::Provisioning);
        let handle = match self.provision(&backend, metadata, &ctx).await {
            Ok(handle) => handle,
            Err(error) => {
                let execution = Execution::failed(error);
                advance(&mut machine, outcome_state(execution.outcome));
                // Nothing was handed over; prepare released what it allocated
                advance(&mut machine, InvocationState::TornDown);
                return self.finish(metadata, engine, &machine, execution, false, started);
            }
        };

        advance(&mut machine, InvocationState::Running);
        let cold_start = handle.cold_start();
        let execution = self.execute(&backend, &handle, &event, &ctx).await;
        advance(&mut machine, outcome_state(execution.outcome));

        self.teardown(&backend, handle).await;
        advance(&mut machine, InvocationState::TornDown);

        self.finish(metadata, engine, &machine, execution, cold_start, started)
    }

    /// Fetch the artifact and prepare a sandbox within the deadline.
    async fn provision(
        &self,
        backend: &Arc<dyn ExecutionBackend>,
        metadata: &FunctionMetadata,
        ctx: &InvocationContext,
    ) -> Result<SandboxHandle, InvocationError> {
        let timed_out = || InvocationError::Timeout {
            timeout_secs: metadata.timeout.secs(),
        };

        let artifact = timeout_at(ctx.deadline, self.cache.get(&metadata.storage_key))
            .await
            .map_err(|_| timed_out())??;

        let permit = self.limiter.try_acquire()?;

        let task_backend = Arc::clone(backend);
        let task_metadata = metadata.clone();
        let task_ctx = ctx.clone();
        let mut task = tokio::spawn(async move {
            let _permit = permit;
            task_backend
                .prepare(&task_metadata, artifact, &task_ctx)
                .await
        });

        match timeout_at(ctx.deadline, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(InvocationError::provisioning(format!(
                "prepare task failed: {}",
                e
            ))),
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %ctx.sandbox_id,
                    "Deadline reached while provisioning"
                );
                // Let prepare finish in the background and release its sandbox
                let backend = Arc::clone(backend);
                tokio::spawn(async move {
                    if let Ok(Ok(handle)) = task.await {
                        backend.teardown(handle).await;
                    }
                });
                Err(timed_out())
            }
        }
    }

    /// Run the handler, enforcing the deadline.
    async fn execute(
        &self,
        backend: &Arc<dyn ExecutionBackend>,
        handle: &SandboxHandle,
        event: &Value,
        ctx: &InvocationContext,
    ) -> Execution {
        let invoke =
            AssertUnwindSafe(backend.invoke(handle, event, ctx, ctx.deadline)).catch_unwind();
        tokio::pin!(invoke);

        match timeout_at(ctx.deadline, &mut invoke).await {
            Ok(Ok(Ok(raw))) => Execution {
                outcome: self.collector.classify(&raw),
                raw: Some(raw),
                error: None,
            },
            Ok(Ok(Err(error))) => Execution::failed(error),
            Ok(Err(panic)) => {
                let message = panic_message(&*panic);
                tracing::error!(
                    sandbox_id = %handle.id(),
                    panic = %message,
                    "Backend panicked during invoke"
                );
                Execution::failed(InvocationError::runtime(format!(
                    "backend panicked: {}",
                    message
                )))
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %handle.id(),
                    timeout_secs = ctx.limits.timeout.secs(),
                    "Deadline reached, terminating sandbox"
                );

                self.terminate(backend, handle, Termination::Graceful).await;
                let raw = match timeout(self.config.termination_grace, &mut invoke).await {
                    Ok(done) => done.ok().and_then(Result::ok),
                    Err(_) => {
                        tracing::warn!(
                            sandbox_id = %handle.id(),
                            grace_ms = self.config.termination_grace.as_millis() as u64,
                            "Sandbox ignored graceful termination, forcing"
                        );
                        self.terminate(backend, handle, Termination::Forced).await;
                        match timeout(self.config.kill_grace, &mut invoke).await {
                            Ok(done) => done.ok().and_then(Result::ok),
                            Err(_) => {
                                tracing::error!(
                                    sandbox_id = %handle.id(),
                                    "Sandbox did not acknowledge forced termination, abandoning"
                                );
                                None
                            }
                        }
                    }
                };

                Execution {
                    outcome: Outcome::TimedOut,
                    raw,
                    error: None,
                }
            }
        }
    }

    async fn terminate(
        &self,
        backend: &Arc<dyn ExecutionBackend>,
        handle: &SandboxHandle,
        mode: Termination,
    ) {
        let call = AssertUnwindSafe(backend.terminate(handle, mode)).catch_unwind();
        match timeout(TERMINATE_TIMEOUT, call).await {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => tracing::error!(
                sandbox_id = %handle.id(),
                panic = %panic_message(&*panic),
                "Backend panicked during terminate"
            ),
            Err(_) => tracing::warn!(
                sandbox_id = %handle.id(),
                mode = ?mode,
                "Terminate call did not return in time"
            ),
        }
    }

    async fn teardown(&self, backend: &Arc<dyn ExecutionBackend>, handle: SandboxHandle) {
        let sandbox_id = handle.id().clone();
        let call = AssertUnwindSafe(backend.teardown(handle)).catch_unwind();
        match timeout(TEARDOWN_TIMEOUT, call).await {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => tracing::error!(
                sandbox_id = %sandbox_id,
                panic = %panic_message(&*panic),
                "Backend panicked during teardown"
            ),
            Err(_) => tracing::error!(
                sandbox_id = %sandbox_id,
                timeout_secs = TEARDOWN_TIMEOUT.as_secs(),
                "Teardown did not finish in time"
            ),
        }
    }

    fn finish(
        &self,
        metadata: &FunctionMetadata,
        engine: EngineKind,
        machine: &InvocationStateMachine,
        execution: Execution,
        cold_start: bool,
        started: Instant,
    ) -> InvocationReport {
        let sandbox_id = machine.sandbox_id().clone();
        let metrics = self.collector.metrics(
            &sandbox_id,
            &metadata.id,
            engine,
            execution.outcome,
            cold_start,
            execution.raw.as_ref(),
            started.elapsed(),
        );

        let result = match (execution.error, execution.outcome, execution.raw) {
            (Some(error), _, _) => Err(error),
            (None, Outcome::TimedOut, raw) => {
                if let Some(raw) = raw {
                    tracing::debug!(
                        sandbox_id = %sandbox_id,
                        stdout = %raw.stdout,
                        stderr = %raw.stderr,
                        "Partial output of timed-out invocation"
                    );
                }
                Err(InvocationError::Timeout {
                    timeout_secs: metadata.timeout.secs(),
                })
            }
            (None, outcome, Some(raw)) => self.collector.normalize(&raw, outcome),
            (None, _, None) => Err(InvocationError::runtime("sandbox produced no output")),
        };

        match &result {
            Ok(ok) => tracing::info!(
                sandbox_id = %sandbox_id,
                function = %metadata.id,
                engine = %engine,
                status = ok.status_code,
                cold_start = cold_start,
                boot_ms = ?metrics.boot_ms,
                duration_ms = metrics.duration_ms,
                total_ms = metrics.total_ms,
                "Invocation completed"
            ),
            Err(error) => {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    function = %metadata.id,
                    engine = %engine,
                    outcome = %metrics.outcome,
                    error_kind = error.kind(),
                    error = %error,
                    total_ms = metrics.total_ms,
                    "Invocation failed"
                );
                if let InvocationError::Runtime { stdout, .. } = error {
                    if !stdout.is_empty() {
                        tracing::debug!(
                            sandbox_id = %sandbox_id,
                            stdout = %stdout,
                            "Handler output of failed invocation"
                        );
                    }
                }
            }
        }

        InvocationReport {
            sandbox_id,
            result,
            metrics,
            lifecycle: StateMachineMetrics::from(machine),
        }
    }
}
