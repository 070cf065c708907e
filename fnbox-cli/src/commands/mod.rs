// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use std::sync::Arc;

use fnbox_core::{Config, FunctionRegistry, InvocationRouter, LifecycleManager};

pub mod invoke;
pub mod list;
pub mod serve;
pub mod validate;

/// Registry, lifecycle manager and router for a validated configuration.
pub fn build_router(
    config: &Config,
) -> Result<(InvocationRouter, Arc<FunctionRegistry>), Box<dyn std::error::Error>> {
    let registry = Arc::new(FunctionRegistry::from_functions(
        config.functions.iter().cloned(),
    )?);
    let manager = Arc::new(LifecycleManager::from_config(config)?);

    std::fs::create_dir_all(&config.engine.work_dir)?;

    let router = InvocationRouter::new(registry.clone(), manager);
    Ok((router, registry))
}
