// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `fnbox validate` command - Validate configuration file.

use fnbox_core::{CodeSource, ConfigLoader, Runtime};

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Engine Settings:");
            println!("  Work Directory:      {}", config.engine.work_dir.display());
            println!(
                "  Max Provisions:      {}",
                config.engine.max_concurrent_provisions
            );
            println!(
                "  Termination Grace:   {}ms (kill grace {}ms)",
                config.engine.termination_grace.as_millis(),
                config.engine.kill_grace.as_millis()
            );
            match &config.code_source {
                CodeSource::Directory(dir) => {
                    println!("  Code Source:         {}", dir.display())
                }
                CodeSource::Http(url) => println!("  Code Source:         {}", url),
            }
            println!();
            println!("Backends:");
            for runtime in [Runtime::Python, Runtime::Nodejs] {
                println!(
                    "  {:<8} docker: {:<20} nanos: {}",
                    runtime.name(),
                    config.container.images.get(&runtime).map_or("-", String::as_str),
                    config.unikernel.packages.get(&runtime).map_or("-", String::as_str)
                );
            }
            println!();
            println!("Functions ({}):", config.functions.len());
            for func in &config.functions {
                println!(
                    "  - {}/{} ({}, memory: {}, timeout: {}, key: {})",
                    func.user_id,
                    func.handler,
                    func.runtime,
                    func.memory,
                    func.timeout,
                    func.storage_key
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
