// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Nanos unikernel backend driven through the `ops` CLI.
//!
//! Runtime packages are downloaded once per process. Each invocation stages
//! its own directory with the entrypoint, handler module, event file and an
//! ops `config.json`, then boots a VM with `ops pkg load`. The VM console is
//! the handler's stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::Instant;

use super::bootstrap;
use super::process;
use super::{
    invocation_payload, ExecutionBackend, InvocationContext, RawOutput, SandboxHandle,
    SandboxResource, Termination,
};
use crate::config::{EngineConfig, UnikernelConfig};
use crate::error::InvocationError;
use crate::registry::FunctionMetadata;
use crate::singleflight::SingleFlight;
use crate::types::EngineKind;

const PACKAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(300);
const CONFIG_FILE: &str = "config.json";
const EVENT_FILE: &str = "event.json";

fn pull_abandoned(package: &String, reason: String) -> String {
    format!("package download for {} abandoned: {}", package, reason)
}

/// Nanos-based [`ExecutionBackend`].
pub struct UnikernelBackend {
    config: UnikernelConfig,
    max_output_bytes: usize,
    pulls: SingleFlight<String, bool, String>,
    /// Packages known to be in the local ops cache.
    warmed: Arc<DashMap<String, ()>>,
}

impl UnikernelBackend {
    pub fn new(config: UnikernelConfig, engine: &EngineConfig) -> Self {
        Self {
            config,
            max_output_bytes: engine.max_output_bytes,
            pulls: SingleFlight::new(pull_abandoned),
            warmed: Arc::new(DashMap::new()),
        }
    }

    /// Download `package` unless already local. Returns true if it was fetched.
    async fn ensure_package(&self, package: &str) -> Result<bool, InvocationError> {
        if self.warmed.contains_key(package) {
            return Ok(false);
        }

        let binary = self.config.ops_binary.clone();
        let warmed = Arc::clone(&self.warmed);
        let name = package.to_string();

        self.pulls
            .run(package.to_string(), move || async move {
                let started = std::time::Instant::now();
                let mut cmd = Command::new(&binary);
                cmd.args(["pkg", "get", name.as_str()]).kill_on_drop(true);

                let out = match tokio::time::timeout(PACKAGE_FETCH_TIMEOUT, cmd.output()).await {
                    Ok(Ok(out)) => out,
                    Ok(Err(e)) => return Err(format!("failed to run {}: {}", binary, e)),
                    Err(_) => {
                        return Err(format!(
                            "ops pkg get {} did not finish within {}s",
                            name,
                            PACKAGE_FETCH_TIMEOUT.as_secs()
                        ))
                    }
                };
                if !out.status.success() {
                    return Err(format!(
                        "ops pkg get {} failed: {}",
                        name,
                        String::from_utf8_lossy(&out.stderr).trim()
                    ));
                }

                tracing::info!(
                    package = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Fetched unikernel package"
                );
                warmed.insert(name, ());
                Ok(true)
            })
            .await
            .map_err(InvocationError::provisioning)
    }

    async fn stage(
        &self,
        metadata: &FunctionMetadata,
        artifact: &[u8],
        ctx: &InvocationContext,
    ) -> std::io::Result<PathBuf> {
        let staged = bootstrap::stage(&ctx.workdir, metadata, artifact).await?;
        let (entry_name, _) = bootstrap::entrypoint(metadata.runtime);

        let mut env = serde_json::Map::new();
        for (key, value) in bootstrap::handler_env(metadata, &format!("/{}", bootstrap::CODE_DIR)) {
            env.insert(key.to_string(), Value::String(value));
        }
        env.insert(
            "FNBOX_EVENT_FILE".to_string(),
            Value::String(format!("/{}", EVENT_FILE)),
        );

        let config = json!({
            "Args": [entry_name],
            "Dirs": [bootstrap::CODE_DIR],
            "Files": [entry_name, EVENT_FILE],
            "Env": env,
            "RunConfig": {
                "Memory": format!("{}m", ctx.limits.memory.megabytes()),
            },
        });
        let path = staged.root.join(CONFIG_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&config)?).await?;
        Ok(path)
    }
}

#[async_trait]
impl ExecutionBackend for UnikernelBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Unikernel
    }

    async fn prepare(
        &self,
        metadata: &FunctionMetadata,
        artifact: Bytes,
        ctx: &InvocationContext,
    ) -> Result<SandboxHandle, InvocationError> {
        let package = self
            .config
            .packages
            .get(&metadata.runtime)
            .cloned()
            .ok_or_else(|| {
                InvocationError::provisioning(format!(
                    "no nanos package configured for runtime {}",
                    metadata.runtime
                ))
            })?;
        let cold_start = self.ensure_package(&package).await?;

        if let Err(e) = self.stage(metadata, &artifact, ctx).await {
            super::remove_workdir(&ctx.sandbox_id, &ctx.workdir).await;
            return Err(InvocationError::provisioning(format!(
                "failed to stage unikernel workdir: {}",
                e
            )));
        }

        tracing::debug!(
            sandbox_id = %ctx.sandbox_id,
            package = %package,
            workdir = %ctx.workdir.display(),
            cold_start = cold_start,
            "Unikernel staged"
        );

        Ok(SandboxHandle::new(
            ctx.sandbox_id.clone(),
            EngineKind::Unikernel,
            SandboxResource::Vm {
                instance: ctx.sandbox_id.to_string(),
                package,
            },
            ctx.workdir.clone(),
            cold_start,
        ))
    }

    async fn invoke(
        &self,
        handle: &SandboxHandle,
        event: &Value,
        ctx: &InvocationContext,
        deadline: Instant,
    ) -> Result<RawOutput, InvocationError> {
        let SandboxResource::Vm { package, .. } = handle.resource() else {
            return Err(InvocationError::runtime(format!(
                "unikernel backend handed a foreign sandbox: {:?}",
                handle.resource()
            )));
        };

        // The image is assembled at boot, so the event must be on disk first
        tokio::fs::write(
            handle.workdir().join(EVENT_FILE),
            invocation_payload(event, ctx),
        )
        .await
        .map_err(|e| InvocationError::runtime(format!("failed to write event file: {}", e)))?;

        let mut cmd = Command::new(&self.config.ops_binary);
        cmd.args(["pkg", "load", package.as_str(), "-c", CONFIG_FILE])
            .current_dir(handle.workdir());

        tracing::debug!(
            sandbox_id = %handle.id(),
            remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Booting unikernel"
        );

        let raw = process::run(cmd, None, handle.process(), self.max_output_bytes)
            .await
            .map_err(|e| {
                InvocationError::runtime(format!("failed to run {}: {}", self.config.ops_binary, e))
            })?;

        if let Some(boot) = raw.boot_latency {
            tracing::debug!(
                sandbox_id = %handle.id(),
                boot_ms = boot.as_millis() as u64,
                "Unikernel booted"
            );
        }

        Ok(raw)
    }

    async fn terminate(&self, handle: &SandboxHandle, mode: Termination) {
        // ops forwards SIGTERM to the hypervisor as a power-down request
        process::signal_group(handle.process(), mode);
    }

    async fn teardown(&self, handle: SandboxHandle) {
        process::signal_group(handle.process(), Termination::Forced);
        super::remove_workdir(handle.id(), handle.workdir()).await;

        tracing::debug!(sandbox_id = %handle.id(), "Unikernel sandbox torn down");
    }
}
