// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Minimum allowed memory limit: 16 MB
const MIN_MEMORY_MB: u64 = 16;
/// Maximum allowed memory limit: 16 GB
const MAX_MEMORY_MB: u64 = 16 * 1024;
/// Maximum handler timeout: 15 minutes
const MAX_TIMEOUT_SECS: u64 = 900;

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Owner of a function, as it appears in the invocation path.
/// Non-empty, alphanumeric with hyphens/underscores, max 128 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Create a new UserId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() || id.len() > 128 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "user_id",
                reason: format!("User ID must be 1-128 chars, got {}", id.len()),
                value: id,
            });
        }

        if !id.chars().all(|c| is_ident_char(c) || c == '-') {
            return Err(HardValidationError::InvalidFieldValue {
                field: "user_id",
                value: id,
                reason: "User ID must contain only alphanumeric characters, hyphens, and underscores".to_string(),
            });
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// Handler reference in `module.function` form, e.g. `main.run` or `index.handler`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HandlerName {
    raw: String,
    dot: usize,
}

impl HandlerName {
    /// Create a new HandlerName with validation.
    pub fn new(handler: impl Into<String>) -> Result<Self, HardValidationError> {
        let raw = handler.into();
        let invalid = |reason: &str| HardValidationError::InvalidFieldValue {
            field: "handler",
            value: raw.clone(),
            reason: reason.to_string(),
        };

        let (module, function) = raw
            .split_once('.')
            .ok_or_else(|| invalid("Handler must have the form module.function"))?;

        if module.is_empty() || function.is_empty() || function.contains('.') {
            return Err(invalid("Handler must have the form module.function"));
        }

        if !module.chars().all(|c| is_ident_char(c) || c == '-') {
            return Err(invalid("Module name contains invalid characters"));
        }

        if !function.chars().all(is_ident_char) {
            return Err(invalid("Function name contains invalid characters"));
        }

        let dot = module.len();
        Ok(Self { raw, dot })
    }

    /// Module (file stem) part of the handler.
    pub fn module(&self) -> &str {
        &self.raw[..self.dot]
    }

    /// Function part of the handler.
    pub fn function(&self) -> &str {
        &self.raw[self.dot + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl TryFrom<String> for HandlerName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<HandlerName> for String {
    fn from(handler: HandlerName) -> Self {
        handler.raw
    }
}

/// Key of one immutable artifact version in the code store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// Create a new StorageKey with validation.
    pub fn new(key: impl Into<String>) -> Result<Self, HardValidationError> {
        let key = key.into();

        if key.is_empty() || key.len() > 512 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "storage_key",
                reason: format!("Storage key must be 1-512 chars, got {}", key.len()),
                value: key,
            });
        }

        // Keys are joined onto directories and URLs
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return Err(HardValidationError::InvalidFieldValue {
                field: "storage_key",
                value: key,
                reason: "Storage key must be relative and must not contain '..'".to_string(),
            });
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for StorageKey {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}

/// Validated memory ceiling in megabytes.
/// Must be between MIN_MEMORY_MB and MAX_MEMORY_MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct MemoryLimit(u64);

impl MemoryLimit {
    /// Create a new MemoryLimit with bounds validation.
    pub fn from_mb(mb: u64) -> Result<Self, HardValidationError> {
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&mb) {
            return Err(HardValidationError::MemoryLimitOutOfBounds {
                mb,
                min: MIN_MEMORY_MB,
                max: MAX_MEMORY_MB,
            });
        }
        Ok(Self(mb))
    }

    pub fn megabytes(&self) -> u64 {
        self.0
    }

    pub fn bytes(&self) -> u64 {
        self.0 * 1024 * 1024
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self(128)
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MB", self.0)
    }
}

impl TryFrom<u64> for MemoryLimit {
    type Error = HardValidationError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_mb(value)
    }
}

impl From<MemoryLimit> for u64 {
    fn from(limit: MemoryLimit) -> Self {
        limit.0
    }
}

/// Validated handler timeout in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct TimeoutSecs(u64);

impl TimeoutSecs {
    pub fn new(secs: u64) -> Result<Self, HardValidationError> {
        if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
            return Err(HardValidationError::TimeoutOutOfBounds {
                secs,
                min: 1,
                max: MAX_TIMEOUT_SECS,
            });
        }
        Ok(Self(secs))
    }

    pub fn secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for TimeoutSecs {
    fn default() -> Self {
        Self(30)
    }
}

impl fmt::Display for TimeoutSecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

impl TryFrom<u64> for TimeoutSecs {
    type Error = HardValidationError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TimeoutSecs> for u64 {
    fn from(timeout: TimeoutSecs) -> Self {
        timeout.0
    }
}

/// Language runtime a function is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Python,
    Nodejs,
}

impl Runtime {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Nodejs => "nodejs",
        }
    }

    /// Source file extension of a handler module.
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Nodejs => "js",
        }
    }

    /// Interpreter binary inside the sandbox.
    pub const fn interpreter(&self) -> &'static str {
        match self {
            Self::Python => "python3",
            Self::Nodejs => "node",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Runtime {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Self::Python),
            "nodejs" | "node" => Ok(Self::Nodejs),
            other => Err(HardValidationError::InvalidFieldValue {
                field: "runtime",
                value: other.to_string(),
                reason: "Runtime must be one of: python, nodejs".to_string(),
            }),
        }
    }
}

/// Execution backend selected per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Process-isolated container (`docker` selector).
    Container,
    /// Nanos unikernel VM (`nanos` selector).
    Unikernel,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [Self::Container, Self::Unikernel];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Unikernel => "unikernel",
        }
    }

    /// Path segment that selects this engine.
    pub const fn selector(&self) -> &'static str {
        match self {
            Self::Container => "docker",
            Self::Unikernel => "nanos",
        }
    }

    /// Parse an engine selector path segment.
    pub fn from_selector(selector: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.selector() == selector)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identifier of one sandbox. Never reused across invocations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(String);

impl SandboxId {
    /// Generate a fresh identifier for the given engine.
    pub fn generate(engine: EngineKind) -> Self {
        Self(format!(
            "fnbox-{}-{}",
            engine.name(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
