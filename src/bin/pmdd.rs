//! PMD daemon
//!
//! Connects to one PiezoMotor PMD controller, keeps it polled, publishes
//! its state as JSON lines on stdout and takes motor commands from stdin.

use anyhow::{Context, Result};
use clap::Parser;
use pmdd::{CommandStream, DaemonConfig, MonitorOutput, PmdController};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pmdd")]
#[command(about = "PiezoMotor PMD controller daemon with JSON state monitoring")]
#[command(version)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bridge host from the config
    #[arg(long)]
    host: Option<String>,

    /// Override the bridge port from the config
    #[arg(long)]
    port: Option<u16>,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("PMDD_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("PiezoMotor PMD Daemon");
    info!("{}", "=".repeat(50));
    info!("Using config: {}", config_path);

    let mut config = DaemonConfig::load_from_path(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(host) = args.host {
        config.controller.host = host;
    }
    if let Some(port) = args.port {
        config.controller.port = port;
    }

    info!("Connecting to {}:{}", config.controller.host, config.controller.port);
    let controller = tokio::task::spawn_blocking(move || -> Result<PmdController> {
        let controller = PmdController::connect(config).context("Failed to connect to controller")?;
        controller.initialize().context("Failed to initialize controller")?;
        Ok(controller)
    })
    .await
    .context("Initialization task failed")?;

    let controller = match controller {
        Ok(controller) => Arc::new(controller),
        Err(e) => {
            error!("Controller initialization failed: {:#}", e);
            error!("Make sure:");
            error!("   - The serial-to-Ethernet bridge is reachable");
            error!("   - The PMD controller is powered and cabled");
            error!("   - Configuration files are correct");
            return Err(e);
        }
    };
    info!("Controller ready for commands!");

    let shutdown_signal = Arc::new(AtomicBool::new(false));

    let monitoring_handle = {
        let controller = Arc::clone(&controller);
        let shutdown = Arc::clone(&shutdown_signal);
        tokio::spawn(async move { run_monitoring_loop(controller, shutdown).await })
    };

    let mut stream = CommandStream::new(Arc::clone(&controller), Arc::clone(&shutdown_signal));
    let stream_result = stream.run().await;
    if let Err(e) = &stream_result {
        error!("Command stream error: {}", e);
    }

    shutdown_signal.store(true, Ordering::Relaxed);
    if let Err(e) = monitoring_handle.await {
        error!("Monitoring task failed: {}", e);
    }

    info!("Performing graceful shutdown");
    tokio::task::spawn_blocking(move || controller.shutdown())
        .await
        .context("Failed during shutdown")?;

    info!("Shutdown complete");
    stream_result
}

/// Publish controller snapshots until shutdown is signalled
async fn run_monitoring_loop(controller: Arc<PmdController>, shutdown_signal: Arc<AtomicBool>) {
    let publishing = &controller.config().publishing;
    let mut monitor = MonitorOutput::new(publishing.pub_rate_hz, publishing.only_on_change);
    let mut ticker = tokio::time::interval(publishing.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("State monitoring active at {} Hz", publishing.pub_rate_hz);

    while !shutdown_signal.load(Ordering::Relaxed) {
        ticker.tick().await;

        let snapshot = controller.snapshot();
        if monitor.should_output(&snapshot) {
            monitor.output(&snapshot);
        }
    }

    info!("State monitoring stopped");
}
