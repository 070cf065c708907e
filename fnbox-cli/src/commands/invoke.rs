// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `fnbox invoke` command - Run one invocation without the HTTP gateway.

use bytes::Bytes;
use fnbox_core::ConfigLoader;

pub async fn execute(
    config_path: &str,
    user: &str,
    handler: &str,
    engine: &str,
    event: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;
    let (router, _) = super::build_router(&config)?;

    let body = event.map(Bytes::from).unwrap_or_default();
    if !body.is_empty() {
        serde_json::from_slice::<serde_json::Value>(&body)
            .map_err(|e| format!("--event is not valid JSON: {}", e))?;
    }

    let path = format!("/{}/{}/{}", user, handler, engine);
    tracing::debug!(path = %path, "Invoking function");
    let response = router.handle(&path, Vec::new(), body).await;

    println!("Status: {}", response.status);
    println!("{}", serde_json::to_string_pretty(&response.body)?);

    if let Some(metrics) = &response.metrics {
        println!();
        println!("  Sandbox:    {}", metrics.sandbox_id);
        println!("  Outcome:    {}", metrics.outcome);
        println!("  Cold start: {}", metrics.cold_start);
        if let Some(boot_ms) = metrics.boot_ms {
            println!("  Boot:       {}ms", boot_ms);
        }
        println!("  Duration:   {}ms (total {}ms)", metrics.duration_ms, metrics.total_ms);
        if let Some(mb) = metrics.memory_peak_mb {
            println!("  Memory:     {}MB peak", mb);
        }
    }

    if response.status >= 400 {
        std::process::exit(1);
    }
    Ok(())
}
