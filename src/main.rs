//! dock-schedule CLI entry point.

use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "dock-schedule", version)]
#[command(about = "Distributed cron-style job execution for container clusters")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler service (the single authoritative instance)
    Scheduler,
    /// Run a worker service replica
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = dock_schedule::config::Config::load()?;
    let shutdown_rx = spawn_signal_listener()?;

    match cli.command {
        Command::Scheduler => dock_schedule::scheduler::run(config, shutdown_rx).await?,
        Command::Worker => dock_schedule::worker::run(config, shutdown_rx).await?,
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Translate SIGINT/SIGTERM into the process-wide shutdown signal observed
/// by the service loops. In-flight job executions are allowed to finish.
fn spawn_signal_listener() -> anyhow::Result<watch::Receiver<bool>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    Ok(shutdown_rx)
}
