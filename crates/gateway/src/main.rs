use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_domain::config::{Config, ConfigSeverity};
use kiln_gateway::cli::{Cli, Command, ConfigCommand};
use kiln_gateway::runtime::worker;
use kiln_gateway::{api, bootstrap};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            serve().await
        }
        Some(Command::Worker) => {
            init_tracing();
            run_worker().await
        }
        Some(Command::Config {
            command: ConfigCommand::Validate,
        }) => {
            let config = Config::from_env();
            let issues = config.validate();
            if issues.is_empty() {
                println!("configuration ok");
                return Ok(());
            }
            let mut failed = false;
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => println!("warning: {issue}"),
                    ConfigSeverity::Error => {
                        failed = true;
                        println!("error: {issue}");
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("kilnd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for server processes.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kiln_gateway=debug")),
        )
        .json()
        .init();
}

async fn serve() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    let state = bootstrap::build_state(config.clone()).await?;
    let background = bootstrap::spawn_background(&state);
    let workers = worker::spawn_workers(state.clone(), config.workers);

    let app = api::router(state.clone()).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, workers = config.workers, "kiln gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    bootstrap::shutdown(&state).await;
    drain(workers, Duration::from_secs(30)).await;
    for handle in background {
        handle.abort();
    }
    Ok(())
}

async fn run_worker() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    let state = bootstrap::build_state(config.clone()).await?;
    let background = bootstrap::spawn_background(&state);
    let workers = worker::spawn_workers(state.clone(), config.workers);
    tracing::info!(workers = config.workers, "kiln worker process started");

    shutdown_signal().await;

    bootstrap::shutdown(&state).await;
    drain(workers, Duration::from_secs(30)).await;
    for handle in background {
        handle.abort();
    }
    Ok(())
}

/// Let workers finish their in-flight runs, bounded.
async fn drain(workers: Vec<tokio::task::JoinHandle<()>>, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    for mut handle in workers {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if tokio::time::timeout(remaining, &mut handle).await.is_err() {
            tracing::warn!("worker did not drain in time, aborting");
            handle.abort();
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown signal handler");
    }
    tracing::info!("shutdown signal received");
}
