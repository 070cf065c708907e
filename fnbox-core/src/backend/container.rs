// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Container backend driven through the Docker CLI.
//!
//! One image per function version, tagged by content hash and built at most
//! once per tag. Each invocation gets a fresh container with memory, CPU and
//! pid limits and no network, started attached with the payload on stdin.

use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::Instant;

use super::bootstrap::{self, content_tag};
use super::process;
use super::{
    invocation_payload, ExecutionBackend, InvocationContext, RawOutput, SandboxHandle,
    SandboxResource, Termination,
};
use crate::config::{ContainerConfig, EngineConfig};
use crate::error::InvocationError;
use crate::registry::FunctionMetadata;
use crate::singleflight::SingleFlight;
use crate::types::{EngineKind, Runtime};

/// Upper bound for docker control commands (create, kill, rm, inspect).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Code directory inside the image.
const IMAGE_CODE_DIR: &str = "/fnbox/code";

/// Exit status of a SIGKILLed container process.
const EXIT_KILLED: i32 = 137;

fn build_abandoned(tag: &String, reason: String) -> String {
    format!("image build for {} abandoned: {}", tag, reason)
}

/// Run a docker control command, bounded by [`CONTROL_TIMEOUT`].
async fn docker(binary: &str, args: &[&str]) -> Result<Output, String> {
    let mut cmd = Command::new(binary);
    cmd.args(args).kill_on_drop(true);

    match tokio::time::timeout(CONTROL_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("failed to run {}: {}", binary, e)),
        Err(_) => Err(format!(
            "{} {} did not finish within {}s",
            binary,
            args.first().copied().unwrap_or_default(),
            CONTROL_TIMEOUT.as_secs()
        )),
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn dockerfile(base: &str, runtime: Runtime) -> String {
    let (entry_name, _) = bootstrap::entrypoint(runtime);
    format!(
        "FROM {base}\n\
         WORKDIR /fnbox\n\
         COPY {entry} /fnbox/{entry}\n\
         COPY {code}/ {code_dir}/\n\
         USER 65534:65534\n\
         ENTRYPOINT [\"{interp}\", \"/fnbox/{entry}\"]\n",
        base = base,
        entry = entry_name,
        code = bootstrap::CODE_DIR,
        code_dir = IMAGE_CODE_DIR,
        interp = runtime.interpreter(),
    )
}

/// Docker-based [`ExecutionBackend`].
pub struct ContainerBackend {
    config: ContainerConfig,
    work_root: PathBuf,
    max_output_bytes: usize,
    builds: SingleFlight<String, bool, String>,
    /// Tags known to exist locally.
    built: Arc<DashMap<String, ()>>,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig, engine: &EngineConfig) -> Self {
        Self {
            config,
            work_root: engine.work_dir.clone(),
            max_output_bytes: engine.max_output_bytes,
            builds: SingleFlight::new(build_abandoned),
            built: Arc::new(DashMap::new()),
        }
    }

    /// Make sure `tag` exists locally. Returns true if this call built it.
    async fn ensure_image(
        &self,
        metadata: &FunctionMetadata,
        artifact: Bytes,
        tag: &str,
    ) -> Result<bool, InvocationError> {
        if self.built.contains_key(tag) {
            return Ok(false);
        }

        let base = self
            .config
            .images
            .get(&metadata.runtime)
            .cloned()
            .ok_or_else(|| {
                InvocationError::provisioning(format!(
                    "no base image configured for runtime {}",
                    metadata.runtime
                ))
            })?;

        let binary = self.config.docker_binary.clone();
        let context_dir = self
            .work_root
            .join(format!("build-{}", uuid::Uuid::new_v4().simple()));
        let built = Arc::clone(&self.built);
        let metadata = metadata.clone();
        let build_tag = tag.to_string();

        self.builds
            .run(tag.to_string(), move || async move {
                // The image may survive from an earlier engine run
                if let Ok(out) = docker(&binary, &["image", "inspect", build_tag.as_str()]).await {
                    if out.status.success() {
                        built.insert(build_tag, ());
                        return Ok(false);
                    }
                }

                let started = std::time::Instant::now();
                let result = async {
                    bootstrap::stage(&context_dir, &metadata, &artifact)
                        .await
                        .map_err(|e| format!("failed to stage build context: {}", e))?;
                    tokio::fs::write(
                        context_dir.join("Dockerfile"),
                        dockerfile(&base, metadata.runtime),
                    )
                    .await
                    .map_err(|e| format!("failed to write Dockerfile: {}", e))?;

                    let dir = context_dir.to_string_lossy().into_owned();
                    let out = Command::new(&binary)
                        .args(["build", "--quiet", "-t", build_tag.as_str(), dir.as_str()])
                        .kill_on_drop(true)
                        .output()
                        .await
                        .map_err(|e| format!("failed to run {}: {}", binary, e))?;
                    if !out.status.success() {
                        return Err(format!("docker build failed: {}", stderr_of(&out)));
                    }
                    Ok::<(), String>(())
                }
                .await;

                let _ = tokio::fs::remove_dir_all(&context_dir).await;
                result?;

                tracing::info!(
                    image = %build_tag,
                    base = %base,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Built function image"
                );
                built.insert(build_tag, ());
                Ok(true)
            })
            .await
            .map_err(InvocationError::provisioning)
    }

    async fn oom_killed(&self, name: &str) -> bool {
        match docker(
            &self.config.docker_binary,
            &["inspect", "--format", "{{.State.OOMKilled}}", name],
        )
        .await
        {
            Ok(out) => String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(_) => false,
        }
    }

    async fn remove_container(&self, name: &str) {
        match docker(&self.config.docker_binary, &["rm", "--force", name]).await {
            Ok(out) if out.status.success() => {}
            Ok(out) => tracing::warn!(
                container = %name,
                stderr = %stderr_of(&out),
                "Failed to remove container"
            ),
            Err(e) => tracing::warn!(container = %name, error = %e, "Failed to remove container"),
        }
    }
}

fn container_name(handle: &SandboxHandle) -> Result<&str, InvocationError> {
    match handle.resource() {
        SandboxResource::Container { name, .. } => Ok(name),
        other => Err(InvocationError::runtime(format!(
            "container backend handed a foreign sandbox: {:?}",
            other
        ))),
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Container
    }

    async fn prepare(
        &self,
        metadata: &FunctionMetadata,
        artifact: Bytes,
        ctx: &InvocationContext,
    ) -> Result<SandboxHandle, InvocationError> {
        let base = self
            .config
            .images
            .get(&metadata.runtime)
            .map(String::as_str)
            .unwrap_or_default();
        let image = content_tag(metadata, base, &artifact);
        let cold_start = self.ensure_image(metadata, artifact, &image).await?;

        let name = ctx.sandbox_id.to_string();
        let memory = format!("{}m", ctx.limits.memory.megabytes());
        let cpus = self.config.cpus.to_string();
        let pids = self.config.pids_limit.to_string();
        let label = format!("fnbox.sandbox={}", name);

        let mut args: Vec<String> = [
            "create",
            "--name",
            name.as_str(),
            "--label",
            label.as_str(),
            "--memory",
            memory.as_str(),
            "--memory-swap",
            memory.as_str(),
            "--cpus",
            cpus.as_str(),
            "--pids-limit",
            pids.as_str(),
            "--network",
            "none",
            "--interactive",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for (key, value) in bootstrap::handler_env(metadata, IMAGE_CODE_DIR) {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.clone());

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let created = docker(&self.config.docker_binary, &argv).await;
        let failure = match created {
            Ok(out) if out.status.success() => None,
            Ok(out) => Some(format!("docker create failed: {}", stderr_of(&out))),
            Err(e) => Some(e),
        };
        if let Some(message) = failure {
            // create may fail after registering the name
            self.remove_container(&name).await;
            return Err(InvocationError::provisioning(message));
        }

        tracing::debug!(
            sandbox_id = %ctx.sandbox_id,
            image = %image,
            memory = %memory,
            cold_start = cold_start,
            "Container created"
        );

        Ok(SandboxHandle::new(
            ctx.sandbox_id.clone(),
            EngineKind::Container,
            SandboxResource::Container { name, image },
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
        let name = container_name(handle)?;

        let mut cmd = Command::new(&self.config.docker_binary);
        cmd.args(["start", "--attach", "--interactive", name]);

        tracing::debug!(
            sandbox_id = %handle.id(),
            remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Starting container"
        );

        let mut raw = process::run(
            cmd,
            Some(invocation_payload(event, ctx)),
            handle.process(),
            self.max_output_bytes,
        )
        .await
        .map_err(|e| {
            InvocationError::runtime(format!(
                "failed to run {}: {}",
                self.config.docker_binary, e
            ))
        })?;

        if raw.exit_code == Some(EXIT_KILLED) && self.oom_killed(name).await {
            raw.stderr.push_str(&format!(
                "\ncontainer exceeded its memory limit of {}\n",
                ctx.limits.memory
            ));
        }

        Ok(raw)
    }

    async fn terminate(&self, handle: &SandboxHandle, mode: Termination) {
        if let SandboxResource::Container { name, .. } = handle.resource() {
            let signal = match mode {
                Termination::Graceful => "SIGTERM",
                Termination::Forced => "SIGKILL",
            };
            // Fails harmlessly if the container already stopped
            if let Err(e) =
                docker(&self.config.docker_binary, &["kill", "--signal", signal, name]).await
            {
                tracing::debug!(container = %name, error = %e, "docker kill failed");
            }
        }
        process::signal_group(handle.process(), mode);
    }

    async fn teardown(&self, handle: SandboxHandle) {
        process::signal_group(handle.process(), Termination::Forced);
        if let SandboxResource::Container { name, .. } = handle.resource() {
            self.remove_container(name).await;
        }
        super::remove_workdir(handle.id(), handle.workdir()).await;

        tracing::debug!(sandbox_id = %handle.id(), "Container sandbox torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_metadata;
    use crate::types::SandboxId;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stand-in for the docker CLI that logs its argv and plays a handler.
    fn fake_docker(dir: &TempDir) -> String {
        let path = dir.path().join("docker");
        let log = dir.path().join("docker.log");
        let script = format!(
            r#"#!/bin/sh
echo "$@" >> {log}
case "$1" in
  image) exit 1 ;;
  start)
    cat > /dev/null
    echo __FNBOX_BOOT__
    echo 'user print'
    echo '__FNBOX_RESULT__ {{"ok":true,"value":{{"statusCode":200,"body":"hi"}},"memoryPeakKB":2048}}'
    ;;
esac
exit 0
"#,
            log = log.display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn backend(dir: &TempDir) -> ContainerBackend {
        let config = ContainerConfig {
            docker_binary: fake_docker(dir),
            ..ContainerConfig::default()
        };
        let engine = EngineConfig {
            work_dir: dir.path().join("work"),
            ..EngineConfig::default()
        };
        ContainerBackend::new(config, &engine)
    }

    fn context(dir: &TempDir, metadata: &FunctionMetadata) -> InvocationContext {
        let id = SandboxId::generate(EngineKind::Container);
        InvocationContext::new(
            id,
            EngineKind::Container,
            metadata,
            Instant::now(),
            &dir.path().join("work"),
        )
    }

    #[test]
    fn test_dockerfile() {
        let file = dockerfile("python:3.12-slim", Runtime::Python);
        assert!(file.starts_with("FROM python:3.12-slim\n"));
        assert!(file.contains("ENTRYPOINT [\"python3\", \"/fnbox/bootstrap.py\"]"));
    }

    #[tokio::test]
    async fn test_prepare_invoke_teardown() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let metadata = test_metadata("u1", "main.run");
        let ctx = context(&dir, &metadata);

        let handle = backend
            .prepare(&metadata, Bytes::from_static(b"def run(e, c): pass"), &ctx)
            .await
            .unwrap();
        assert!(handle.cold_start());

        let raw = backend
            .invoke(&handle, &serde_json::json!({}), &ctx, ctx.deadline)
            .await
            .unwrap();
        assert_eq!(raw.exit_code, Some(0));
        assert!(raw.stdout.contains("user print"));
        assert!(raw.boot_latency.is_some());

        backend.teardown(handle).await;

        let log = std::fs::read_to_string(dir.path().join("docker.log")).unwrap();
        assert!(log.contains("build --quiet -t fnbox-fn-python:"));
        assert!(log.contains("--memory 128m --memory-swap 128m"));
        assert!(log.contains("--network none"));
        assert!(log.contains("--env FNBOX_HANDLER=main.run"));
        assert!(log.contains(&format!("rm --force {}", ctx.sandbox_id)));
    }

    #[tokio::test]
    async fn test_image_built_once_per_version() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let metadata = test_metadata("u1", "main.run");

        let first = backend
            .prepare(&metadata, Bytes::from_static(b"v1"), &context(&dir, &metadata))
            .await
            .unwrap();
        let second = backend
            .prepare(&metadata, Bytes::from_static(b"v1"), &context(&dir, &metadata))
            .await
            .unwrap();
        assert!(first.cold_start());
        assert!(!second.cold_start());

        let third = backend
            .prepare(&metadata, Bytes::from_static(b"v2"), &context(&dir, &metadata))
            .await
            .unwrap();
        assert!(third.cold_start());

        for handle in [first, second, third] {
            backend.teardown(handle).await;
        }

        let log = std::fs::read_to_string(dir.path().join("docker.log")).unwrap();
        assert_eq!(log.lines().filter(|l| l.starts_with("build")).count(), 2);
    }

    #[tokio::test]
    async fn test_missing_base_image_is_provisioning_error() {
        let dir = TempDir::new().unwrap();
        let mut config = ContainerConfig {
            docker_binary: fake_docker(&dir),
            ..ContainerConfig::default()
        };
        config.images.clear();
        let backend = ContainerBackend::new(config, &EngineConfig::default());
        let metadata = test_metadata("u1", "main.run");

        let err = backend
            .prepare(&metadata, Bytes::from_static(b"v1"), &context(&dir, &metadata))
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Provisioning { .. }));
    }
}
