// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `fnbox list` command - List functions from configuration.

use fnbox_core::{ConfigLoader, FunctionRegistry};

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;

    if config.functions.is_empty() {
        println!("No functions defined in configuration.");
        return Ok(());
    }

    let registry = FunctionRegistry::from_functions(config.functions)?;
    let functions = registry.list();

    println!("╔══════════════════════════════════════════════════════════════════════════════╗");
    println!("║                           CONFIGURED FUNCTIONS                               ║");
    println!("╠══════════════════╦═══════════════════╦═════════╦══════════╦══════════════════╣");
    println!("║ User             ║ Handler           ║ Runtime ║ Memory   ║ Timeout          ║");
    println!("╠══════════════════╬═══════════════════╬═════════╬══════════╬══════════════════╣");

    for func in &functions {
        println!(
            "║ {:<16} ║ {:<17} ║ {:<7} ║ {:<8} ║ {:<16} ║",
            func.user_id.as_str(),
            func.handler.as_str(),
            func.runtime.name(),
            format!("{}", func.memory),
            format!("{}", func.timeout)
        );
    }

    println!("╚══════════════════╩═══════════════════╩═════════╩══════════╩══════════════════╝");
    println!();
    println!("Total: {} function(s)", functions.len());

    Ok(())
}
