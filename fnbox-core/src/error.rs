// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for fnbox.
//!
//! Explicit enum error types only. No `Box<dyn Error>`, no `anyhow::Result`
//! in the library - every failure an invocation can end in has its own variant.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the engine and its configuration layer.
#[derive(Debug, Error)]
pub enum FnboxError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    // =========================================================================
    // Invocation Errors
    // =========================================================================
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors abort startup.
/// Used when configuration or an identifier is invalid.
#[derive(Debug, Clone, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Memory limit out of bounds: {mb}MB (min: {min}, max: {max})")]
    MemoryLimitOutOfBounds { mb: u64, min: u64, max: u64 },

    #[error("Timeout out of bounds: {secs}s (min: {min}, max: {max})")]
    TimeoutOutOfBounds { secs: u64, min: u64, max: u64 },

    #[error("Duplicate function: {user_id}/{handler}")]
    DuplicateFunction { user_id: String, handler: String },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// State transition errors for the invocation state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for sandbox {sandbox_id}")]
    InvalidTransition {
        sandbox_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Sandbox {sandbox_id} is in terminal state: {state}")]
    TerminalState {
        sandbox_id: String,
        state: &'static str,
    },
}

/// Artifact retrieval failures.
///
/// `Clone` because one fetch result is handed to every waiter of a collapsed
/// cache miss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("artifact not found: {key}")]
    NotFound { key: String },

    #[error("failed to read artifact {key}: {reason}")]
    Io { key: String, reason: String },

    #[error("failed to download artifact {key}: {reason}")]
    Http { key: String, reason: String },

    #[error("artifact fetch for {key} was abandoned: {reason}")]
    Abandoned { key: String, reason: String },
}

/// Everything an invocation can terminate with other than a result.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("function not found: {user_id}/{handler}")]
    NotFound { user_id: String, handler: String },

    #[error("invalid request: {message}")]
    Validation { message: String },

    #[error("failed to provision sandbox: {message}")]
    Provisioning { message: String },

    #[error("handler exceeded timeout of {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("handler failed: {message}")]
    Runtime {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("provisioning capacity exhausted ({capacity} concurrent sandboxes)")]
    ResourceExhausted { capacity: usize },

    #[error("artifact unavailable: {0}")]
    Fetch(#[from] FetchError),
}

impl InvocationError {
    /// Stable error name used in the response envelope.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFoundError",
            Self::Validation { .. } => "ValidationError",
            Self::Provisioning { .. } => "ProvisioningError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Runtime { .. } => "RuntimeError",
            Self::ResourceExhausted { .. } => "ResourceExhaustedError",
            Self::Fetch(_) => "FetchError",
        }
    }

    /// HTTP status the gateway answers with.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Validation { .. } => 400,
            Self::Timeout { .. } => 504,
            Self::ResourceExhausted { .. } => 503,
            Self::Provisioning { .. } | Self::Runtime { .. } | Self::Fetch(_) => 500,
        }
    }

    /// Whether the caller may retry the same request later.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. } | Self::Fetch(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Runtime failure with no captured output.
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Result type alias using FnboxError.
pub type FnboxResult<T> = Result<T, FnboxError>;
