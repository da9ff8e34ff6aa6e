//! Command-line interface for the `kilnd` binary.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "kilnd", about = "Kiln agent-run orchestration server", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve HTTP and run embedded executor workers (the default).
    Serve,
    /// Run executor workers only (no HTTP listener).
    Worker,
    /// Configuration utilities.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version and exit.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the environment configuration and report issues.
    Validate,
}
