// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `fnbox serve` command - Run the invocation gateway.

use fnbox_core::{ConfigLoader, EngineKind};

use crate::{gateway, metrics};

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(config = %config_path, "Starting fnbox gateway");

    // Load and validate configuration - fail fast on invalid config
    let config = ConfigLoader::load_file(config_path)?;
    let (router, registry) = super::build_router(&config)?;

    tracing::info!(
        functions = registry.len(),
        max_concurrent_provisions = config.engine.max_concurrent_provisions,
        work_dir = %config.engine.work_dir.display(),
        "Configuration validated successfully"
    );

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    FNBOX GATEWAY                             ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    for func in registry.list() {
        println!("▶ {}/{} ({})", func.user_id, func.handler, func.runtime);
    }
    println!();
    println!(
        "  Invoke:  http://0.0.0.0:{}/api/function/{{userId}}/{{handler}}/{{{}}}",
        config.server.listen_port,
        EngineKind::ALL.map(|e| e.selector()).join("|")
    );
    println!(
        "  Metrics: http://0.0.0.0:{}/metrics",
        config.server.metrics_port
    );
    println!();
    println!("Press Ctrl+C to stop");

    metrics::start_metrics_server(config.server.metrics_port);
    let gateway = tokio::spawn(gateway::start_gateway(config.server.listen_port, router));

    tokio::select! {
        result = gateway => {
            // The gateway only returns on a bind or serve error
            result?.map_err(|e| e.to_string())?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!();
            println!("Shutting down...");
            tracing::info!("Shutting down gateway");
        }
    }

    Ok(())
}
