// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Function metadata and the resolver boundary.
//!
//! The engine never owns function records. It asks a [`FunctionResolver`] for
//! them once per invocation. [`FunctionRegistry`] is the in-process resolver
//! used by the gateway and by tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{FnboxError, FnboxResult, HardValidationError, InvocationError};
use crate::types::{HandlerName, MemoryLimit, Runtime, StorageKey, TimeoutSecs, UserId};

/// Resolved function record. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub id: String,
    pub user_id: UserId,
    pub handler: HandlerName,
    pub runtime: Runtime,
    pub timeout: TimeoutSecs,
    pub memory: MemoryLimit,
    pub storage_key: StorageKey,
}

/// Maps `(user, handler)` to function metadata.
#[async_trait]
pub trait FunctionResolver: Send + Sync {
    /// Returns `InvocationError::NotFound` for unknown functions.
    async fn lookup(
        &self,
        user_id: &UserId,
        handler: &HandlerName,
    ) -> Result<FunctionMetadata, InvocationError>;
}

type RegistryKey = (UserId, HandlerName);

/// Thread-safe function registry.
/// Uses DashMap for lock-free concurrent access.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: DashMap<RegistryKey, FunctionMetadata>,
}

impl FunctionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry wrapped in an Arc for sharing across tasks.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Build a registry from validated configuration entries.
    pub fn from_functions(
        functions: impl IntoIterator<Item = FunctionMetadata>,
    ) -> FnboxResult<Self> {
        let registry = Self::new();
        for function in functions {
            registry.register(function)?;
        }
        Ok(registry)
    }

    /// Register a new function.
    /// Fails if the `(user, handler)` pair is already taken.
    pub fn register(&self, metadata: FunctionMetadata) -> FnboxResult<()> {
        use dashmap::mapref::entry::Entry;

        let key = (metadata.user_id.clone(), metadata.handler.clone());
        match self.functions.entry(key) {
            Entry::Occupied(_) => Err(FnboxError::HardValidation(
                HardValidationError::DuplicateFunction {
                    user_id: metadata.user_id.to_string(),
                    handler: metadata.handler.to_string(),
                },
            )),
            Entry::Vacant(slot) => {
                tracing::debug!(
                    user_id = %metadata.user_id,
                    handler = %metadata.handler,
                    runtime = %metadata.runtime,
                    "Registered function"
                );
                slot.insert(metadata);
                Ok(())
            }
        }
    }

    /// Remove a function. Returns the removed record, if any.
    pub fn unregister(&self, user_id: &UserId, handler: &HandlerName) -> Option<FunctionMetadata> {
        self.functions
            .remove(&(user_id.clone(), handler.clone()))
            .map(|(_, metadata)| metadata)
    }

    pub fn get(&self, user_id: &UserId, handler: &HandlerName) -> Option<FunctionMetadata> {
        self.functions
            .get(&(user_id.clone(), handler.clone()))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, user_id: &UserId, handler: &HandlerName) -> bool {
        self.functions
            .contains_key(&(user_id.clone(), handler.clone()))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Snapshot of all registered functions, sorted by user then handler.
    pub fn list(&self) -> Vec<FunctionMetadata> {
        let mut all: Vec<_> = self.functions.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| (&a.user_id, &a.handler).cmp(&(&b.user_id, &b.handler)));
        all
    }
}

#[async_trait]
impl FunctionResolver for FunctionRegistry {
    async fn lookup(
        &self,
        user_id: &UserId,
        handler: &HandlerName,
    ) -> Result<FunctionMetadata, InvocationError> {
        self.get(user_id, handler)
            .ok_or_else(|| InvocationError::NotFound {
                user_id: user_id.to_string(),
                handler: handler.to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) fn test_metadata(user: &str, handler: &str) -> FunctionMetadata {
    FunctionMetadata {
        id: format!("{}-{}", user, handler),
        user_id: UserId::new(user).unwrap(),
        handler: HandlerName::new(handler).unwrap(),
        runtime: Runtime::Python,
        timeout: TimeoutSecs::default(),
        memory: MemoryLimit::default(),
        storage_key: StorageKey::new(format!("{}/{}.py", user, handler)).unwrap(),
    }
}
