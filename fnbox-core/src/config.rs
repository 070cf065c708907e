// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Validates engine, backend and function configuration at boot-up time.
//! Any invalid field results in a HardValidationError that prevents startup.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FnboxError, FnboxResult, HardValidationError};
use crate::registry::FunctionMetadata;
use crate::types::{HandlerName, MemoryLimit, Runtime, StorageKey, TimeoutSecs, UserId};

/// Raw function entry as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawFunctionConfig {
    id: Option<String>,
    user_id: String,
    handler: String,
    runtime: String,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
    #[serde(default = "default_memory_mb")]
    memory_mb: u64,
    storage_key: String,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_memory_mb() -> u64 {
    128
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    #[serde(default = "default_listen_port")]
    listen_port: u16,
    #[serde(default = "default_metrics_port")]
    metrics_port: u16,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9100
}

impl Default for RawServerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEngineConfig {
    #[serde(default = "default_work_dir")]
    work_dir: String,
    #[serde(default = "num_cpus::get")]
    max_concurrent_provisions: usize,
    #[serde(default = "default_termination_grace_ms")]
    termination_grace_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    kill_grace_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    max_output_bytes: usize,
    #[serde(default = "default_stderr_excerpt_bytes")]
    stderr_excerpt_bytes: usize,
    #[serde(default = "default_code_cache_entries")]
    code_cache_entries: usize,
}

fn default_work_dir() -> String {
    "/tmp/fnbox".to_string()
}

fn default_termination_grace_ms() -> u64 {
    2000
}

fn default_kill_grace_ms() -> u64 {
    1000
}

fn default_max_output_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_stderr_excerpt_bytes() -> usize {
    2048
}

fn default_code_cache_entries() -> usize {
    256
}

impl Default for RawEngineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            max_concurrent_provisions: num_cpus::get(),
            termination_grace_ms: default_termination_grace_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            max_output_bytes: default_max_output_bytes(),
            stderr_excerpt_bytes: default_stderr_excerpt_bytes(),
            code_cache_entries: default_code_cache_entries(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawContainerConfig {
    docker_binary: Option<String>,
    cpus: Option<f64>,
    pids_limit: Option<u32>,
    #[serde(default)]
    images: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUnikernelConfig {
    ops_binary: Option<String>,
    #[serde(default)]
    packages: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCodeSource {
    directory: Option<String>,
    http: Option<String>,
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: RawServerConfig,
    #[serde(default)]
    engine: RawEngineConfig,
    #[serde(default)]
    container: RawContainerConfig,
    #[serde(default)]
    unikernel: RawUnikernelConfig,
    #[serde(default)]
    code_source: RawCodeSource,
    #[serde(default)]
    functions: Vec<RawFunctionConfig>,
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_port: u16,
    pub metrics_port: u16,
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parent directory of every sandbox workdir.
    pub work_dir: PathBuf,
    /// Provisioning limiter capacity.
    pub max_concurrent_provisions: usize,
    /// Wait after the graceful termination signal before escalating.
    pub termination_grace: Duration,
    /// Wait after the forced kill before abandoning the sandbox.
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
    pub stderr_excerpt_bytes: usize,
    pub code_cache_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let raw = RawEngineConfig::default();
        Self {
            work_dir: PathBuf::from(raw.work_dir),
            max_concurrent_provisions: raw.max_concurrent_provisions.max(1),
            termination_grace: Duration::from_millis(raw.termination_grace_ms),
            kill_grace: Duration::from_millis(raw.kill_grace_ms),
            max_output_bytes: raw.max_output_bytes,
            stderr_excerpt_bytes: raw.stderr_excerpt_bytes,
            code_cache_entries: raw.code_cache_entries,
        }
    }
}

/// Validated container backend configuration.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub docker_binary: String,
    pub cpus: f64,
    pub pids_limit: u32,
    /// Base image per runtime.
    pub images: HashMap<Runtime, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            cpus: 1.0,
            pids_limit: 256,
            images: HashMap::from([
                (Runtime::Python, "python:3.12-slim".to_string()),
                (Runtime::Nodejs, "node:20-slim".to_string()),
            ]),
        }
    }
}

/// Validated unikernel backend configuration.
#[derive(Debug, Clone)]
pub struct UnikernelConfig {
    pub ops_binary: String,
    /// Nanos runtime package per runtime.
    pub packages: HashMap<Runtime, String>,
}

impl Default for UnikernelConfig {
    fn default() -> Self {
        Self {
            ops_binary: "ops".to_string(),
            packages: HashMap::from([
                (Runtime::Python, "eyberg/python:3.10.6".to_string()),
                (Runtime::Nodejs, "eyberg/node:20.5.0".to_string()),
            ]),
        }
    }
}

/// Where function artifacts are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    Directory(PathBuf),
    Http(String),
}

/// Complete validated configuration.
#[derive(Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub container: ContainerConfig,
    pub unikernel: UnikernelConfig,
    pub code_source: CodeSource,
    pub functions: Vec<FunctionMetadata>,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> FnboxResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(FnboxError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| FnboxError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> FnboxResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| FnboxError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> FnboxResult<Config> {
        let server = Self::validate_server(raw.server)?;
        let engine = Self::validate_engine(raw.engine)?;
        let container = Self::validate_container(raw.container)?;
        let unikernel = Self::validate_unikernel(raw.unikernel)?;

        let code_source = match (raw.code_source.directory, raw.code_source.http) {
            (Some(_), Some(_)) => {
                return Err(HardValidationError::SchemaValidation {
                    message: "code_source takes either 'directory' or 'http', not both"
                        .to_string(),
                }
                .into());
            }
            (dir, None) => CodeSource::Directory(PathBuf::from(
                dir.unwrap_or_else(|| "./functions".to_string()),
            )),
            (None, Some(url)) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(HardValidationError::InvalidFieldValue {
                        field: "code_source.http",
                        value: url,
                        reason: "Must be an http:// or https:// URL".to_string(),
                    }
                    .into());
                }
                CodeSource::Http(url.trim_end_matches('/').to_string())
            }
        };

        let mut functions = Vec::with_capacity(raw.functions.len());
        let mut seen = HashSet::new();

        for (index, raw_func) in raw.functions.into_iter().enumerate() {
            let func = Self::validate_function(raw_func, index)?;

            if !seen.insert((func.user_id.clone(), func.handler.clone())) {
                return Err(HardValidationError::DuplicateFunction {
                    user_id: func.user_id.to_string(),
                    handler: func.handler.to_string(),
                }
                .into());
            }

            functions.push(func);
        }

        Ok(Config {
            server,
            engine,
            container,
            unikernel,
            code_source,
            functions,
        })
    }

    fn validate_server(raw: RawServerConfig) -> FnboxResult<ServerConfig> {
        for (field, port) in [
            ("server.listen_port", raw.listen_port),
            ("server.metrics_port", raw.metrics_port),
        ] {
            if port == 0 {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: "0".to_string(),
                    reason: "Port 0 is reserved and cannot be used".to_string(),
                }
                .into());
            }
        }

        if raw.listen_port == raw.metrics_port {
            return Err(HardValidationError::InvalidFieldValue {
                field: "server.metrics_port",
                value: raw.metrics_port.to_string(),
                reason: "Metrics port must differ from the listen port".to_string(),
            }
            .into());
        }

        Ok(ServerConfig {
            listen_port: raw.listen_port,
            metrics_port: raw.metrics_port,
        })
    }

    fn validate_engine(raw: RawEngineConfig) -> FnboxResult<EngineConfig> {
        if raw.max_concurrent_provisions == 0 || raw.max_concurrent_provisions > 4096 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "engine.max_concurrent_provisions",
                value: raw.max_concurrent_provisions.to_string(),
                reason: "Must be between 1 and 4096".to_string(),
            }
            .into());
        }

        // Grace periods bound how long a timed-out invocation may linger
        if raw.termination_grace_ms > 60_000 || raw.kill_grace_ms > 60_000 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "engine.termination_grace_ms",
                value: format!("{}/{}", raw.termination_grace_ms, raw.kill_grace_ms),
                reason: "Grace periods must not exceed 60000ms".to_string(),
            }
            .into());
        }

        const MIN_OUTPUT: usize = 4 * 1024;
        if raw.max_output_bytes < MIN_OUTPUT {
            return Err(HardValidationError::InvalidFieldValue {
                field: "engine.max_output_bytes",
                value: raw.max_output_bytes.to_string(),
                reason: format!("Must be at least {} bytes", MIN_OUTPUT),
            }
            .into());
        }

        if raw.stderr_excerpt_bytes == 0 || raw.stderr_excerpt_bytes > raw.max_output_bytes {
            return Err(HardValidationError::InvalidFieldValue {
                field: "engine.stderr_excerpt_bytes",
                value: raw.stderr_excerpt_bytes.to_string(),
                reason: "Must be non-zero and not larger than max_output_bytes".to_string(),
            }
            .into());
        }

        if raw.work_dir.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "work_dir",
                context: "engine".to_string(),
            }
            .into());
        }

        Ok(EngineConfig {
            work_dir: PathBuf::from(raw.work_dir),
            max_concurrent_provisions: raw.max_concurrent_provisions,
            termination_grace: Duration::from_millis(raw.termination_grace_ms),
            kill_grace: Duration::from_millis(raw.kill_grace_ms),
            max_output_bytes: raw.max_output_bytes,
            stderr_excerpt_bytes: raw.stderr_excerpt_bytes,
            code_cache_entries: raw.code_cache_entries,
        })
    }

    fn validate_runtime_map(
        field: &'static str,
        raw: HashMap<String, String>,
        defaults: HashMap<Runtime, String>,
    ) -> FnboxResult<HashMap<Runtime, String>> {
        let mut map = defaults;
        for (runtime, value) in raw {
            let runtime: Runtime = runtime.parse()?;
            if value.trim().is_empty() {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: format!("{}: ''", runtime),
                    reason: "Image/package reference cannot be empty".to_string(),
                }
                .into());
            }
            map.insert(runtime, value);
        }
        Ok(map)
    }

    fn validate_container(raw: RawContainerConfig) -> FnboxResult<ContainerConfig> {
        let defaults = ContainerConfig::default();

        let cpus = raw.cpus.unwrap_or(defaults.cpus);
        if !(cpus > 0.0 && cpus <= 64.0) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "container.cpus",
                value: cpus.to_string(),
                reason: "Must be greater than 0 and at most 64".to_string(),
            }
            .into());
        }

        let pids_limit = raw.pids_limit.unwrap_or(defaults.pids_limit);
        if pids_limit == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "container.pids_limit",
                value: "0".to_string(),
                reason: "Must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(ContainerConfig {
            docker_binary: raw.docker_binary.unwrap_or(defaults.docker_binary),
            cpus,
            pids_limit,
            images: Self::validate_runtime_map("container.images", raw.images, defaults.images)?,
        })
    }

    fn validate_unikernel(raw: RawUnikernelConfig) -> FnboxResult<UnikernelConfig> {
        let defaults = UnikernelConfig::default();
        Ok(UnikernelConfig {
            ops_binary: raw.ops_binary.unwrap_or(defaults.ops_binary),
            packages: Self::validate_runtime_map(
                "unikernel.packages",
                raw.packages,
                defaults.packages,
            )?,
        })
    }

    /// Validate a single function configuration.
    fn validate_function(raw: RawFunctionConfig, index: usize) -> FnboxResult<FunctionMetadata> {
        let context = format!("function at index {}", index);

        if raw.storage_key.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "storage_key",
                context,
            }
            .into());
        }

        let user_id = UserId::new(raw.user_id)?;
        let handler = HandlerName::new(raw.handler)?;
        let runtime: Runtime = raw.runtime.parse()?;
        let timeout = TimeoutSecs::new(raw.timeout_seconds)?;
        let memory = MemoryLimit::from_mb(raw.memory_mb)?;
        let storage_key = StorageKey::new(raw.storage_key)?;

        let id = raw
            .id
            .unwrap_or_else(|| format!("{}-{}", user_id, handler.as_str().replace('.', "-")));

        Ok(FunctionMetadata {
            id,
            user_id,
            handler,
            runtime,
            timeout,
            memory,
            storage_key,
        })
    }
}
