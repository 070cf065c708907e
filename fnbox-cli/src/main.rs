// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! fnbox CLI
//!
//! Command-line interface and HTTP gateway for the fnbox function engine.

use clap::{Parser, Subcommand};

mod commands;
mod gateway;
mod metrics;

/// fnbox - Serverless function invocation engine
#[derive(Parser)]
#[command(name = "fnbox")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fnbox.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP gateway
    Serve,

    /// Invoke a function once and print the result
    Invoke {
        /// Owning user ID
        user: String,

        /// Handler in module.function form
        handler: String,

        /// Engine selector (docker or nanos)
        engine: String,

        /// Event payload as a JSON document
        #[arg(short, long)]
        event: Option<String>,
    },

    /// List registered functions
    List,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Serve => commands::serve::execute(&cli.config).await,
        Commands::Invoke {
            user,
            handler,
            engine,
            event,
        } => commands::invoke::execute(&cli.config, &user, &handler, &engine, event).await,
        Commands::List => commands::list::execute(&cli.config).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
