//! KV Backpressure - operation queue CLI
//!
//! Load-test, probe and inspect the configuration of the backpressure queue.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use kv_backpressure::{
    OperationQueue,
    cli::{Cli, Command},
    config::Config,
    health::ProbeOutcome,
    loadgen::{LoadTestOptions, run_load_test},
    setup_tracing,
    store::MemoryStore,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.command {
        Command::LoadTest {
            rps,
            duration,
            priority,
        } => {
            let options = LoadTestOptions {
                rps,
                duration: Duration::from_secs(duration),
                priority: priority.into(),
                ..LoadTestOptions::default()
            };
            run_load(config, &options).await
        }
        Command::Probe => run_probe(config).await,
        Command::Config => print_config(&config),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

/// Run the load test against the in-memory store
async fn run_load(config: Config, options: &LoadTestOptions) -> anyhow::Result<ExitCode> {
    let queue = Arc::new(
        OperationQueue::builder(config, Arc::new(MemoryStore::new()))
            .start()
            .await
            .context("starting operation queue")?,
    );

    let report = run_load_test(Arc::clone(&queue), options).await;
    let metrics = queue.metrics();
    queue.shutdown().await.context("shutting down operation queue")?;

    let output = serde_json::json!({
        "report": report,
        "metrics": metrics,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("serializing load report")?
    );
    Ok(ExitCode::SUCCESS)
}

/// Run a single health round-trip
async fn run_probe(mut config: Config) -> anyhow::Result<ExitCode> {
    config.health_check.enabled = false;
    let queue = OperationQueue::builder(config, Arc::new(MemoryStore::new()))
        .start()
        .await
        .context("starting operation queue")?;

    let outcome = queue.probe().await;
    let status = queue.health();
    queue.shutdown().await.context("shutting down operation queue")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("serializing health status")?
    );
    match outcome {
        ProbeOutcome::Passed { latency } => {
            info!(latency_ms = latency.as_millis(), "Health probe passed");
            Ok(ExitCode::SUCCESS)
        }
        ProbeOutcome::Failed { error, .. } => {
            error!(error = %error, "Health probe failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Print the effective configuration
fn print_config(config: &Config) -> anyhow::Result<ExitCode> {
    let yaml = serde_yaml::to_string(config).context("serializing configuration")?;
    print!("{yaml}");
    Ok(ExitCode::SUCCESS)
}
