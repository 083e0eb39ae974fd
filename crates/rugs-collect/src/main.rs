//! Rugs-collect: real-time session collector.
//!
//! Usage:
//!   rugs-collect [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Config file path (default: config/collect.toml)
//!   --url <URL>             Feed URL (overrides config)
//!   -o, --output <DIR>      Output root (overrides config)
//!   --profile <PROFILE>     basic | trades | timing | full (overrides config)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use rugs_collect::stats::write_status_file;
use rugs_collect::{CollectConfig, Collector, CollectorStats, ConnectionSupervisor, StatsHandle};

/// CLI arguments for rugs-collect.
#[derive(Parser, Debug)]
#[command(name = "rugs-collect")]
#[command(about = "Real-time session collector and sequence detector")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/collect.toml")]
    config: PathBuf,

    /// Feed WebSocket URL (overrides config file)
    #[arg(long)]
    url: Option<String>,

    /// Output root directory (overrides config file)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Record profile: basic, trades, timing or full
    #[arg(long)]
    profile: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config_missing = !args.config.exists();
    let mut config = if config_missing {
        CollectConfig::default()
    } else {
        CollectConfig::from_file(&args.config)?
    };

    // Apply CLI overrides
    config.apply_overrides(args.url, args.output, args.profile);

    // Initialize logging
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if config_missing {
        warn!("Config file not found at {:?}, using defaults", args.config);
    }

    info!("Starting rugs-collect session collector");
    info!("Feed URL: {}", config.supervisor.url);
    info!("Output root: {:?}", config.output.root);
    info!("Profile: {}", config.profile.as_str());

    // Create shutdown channel (capacity for all subscribers)
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    // Health statistics
    let stats = Arc::new(CollectorStats::new());

    let collector = Collector::new(&config, Arc::clone(&stats));
    let handle = collector.stats_handle();

    // Spawn feed connection task
    let supervisor = ConnectionSupervisor::new(config.supervisor.clone(), Arc::clone(&stats));
    let (signals, supervisor_handle) = supervisor.establish(shutdown_tx.subscribe());
    info!("Connection supervisor started");

    // Spawn session pipeline task
    let collector_shutdown = shutdown_tx.subscribe();
    let mut collector_handle =
        tokio::spawn(async move { collector.run(signals, collector_shutdown).await });
    info!("Session pipeline started");

    // Spawn health logging task
    let health_handle = spawn_health_task(
        handle,
        config.health_log_interval,
        config.output.status_file.clone(),
        shutdown_tx.subscribe(),
    );
    info!("Health logging task started");

    info!("All tasks running. Press Ctrl+C to stop.");

    // Wait for a shutdown signal or a fatal pipeline error
    let early_exit = tokio::select! {
        result = wait_for_signal() => {
            result?;
            None
        }
        joined = &mut collector_handle => Some(joined),
    };

    // Send shutdown signal to all tasks
    info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    let collector_result = match early_exit {
        Some(joined) => joined,
        None => collector_handle.await,
    };
    let pipeline_error = match collector_result {
        Ok(Ok(report)) => {
            info!(
                "Pipeline stopped: {} sessions closed, {} records written",
                report.sessions, report.records_written
            );
            None
        }
        Ok(Err(e)) => {
            error!("Pipeline stopped with error: {}", e);
            Some(anyhow::Error::from(e))
        }
        Err(e) => {
            error!("Pipeline task failed: {}", e);
            Some(anyhow::Error::from(e))
        }
    };

    // Wait for all tasks to complete with timeout
    let shutdown_timeout = Duration::from_secs(10);
    tokio::select! {
        _ = async {
            let _ = supervisor_handle.await;
            let _ = health_handle.await;
        } => {
            info!("All tasks completed");
        }
        _ = tokio::time::sleep(shutdown_timeout) => {
            warn!("Shutdown timeout exceeded, forcing exit");
        }
    }

    // Final stats
    stats.log_stats();
    info!("Shutdown complete");

    match pipeline_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// Spawn the health logging task.
fn spawn_health_task(
    handle: StatsHandle,
    log_interval: Duration,
    status_file: Option<PathBuf>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(log_interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    handle.stats().log_stats();
                    if let Some(path) = &status_file {
                        let snapshot = handle.snapshot();
                        if let Err(e) = write_status_file(path, &snapshot) {
                            warn!("Failed to write status file {:?}: {}", path, e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Health logger received shutdown signal");
                    break;
                }
            }
        }
    })
}
