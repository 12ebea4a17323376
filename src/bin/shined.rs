//! Supervisor daemon binary.
//!
//! Loads the prism configuration, spawns one panel controller per prism,
//! and then sits in an event loop: health checks every 30 seconds, SIGHUP
//! (or `config/reload`) re-applies the config by name diff, SIGTERM/SIGINT
//! stop every panel and exit.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedSender};

use shine::config::Config;
use shine::rpc::{RpcIncoming, RpcServer};
use shine::state::DaemonStateWriter;
use shine::supervisor::{find_controller_bin, Supervisor, SupervisorEvent, HEALTH_INTERVAL};
use shine::{paths, VERSION};

#[derive(Parser)]
#[command(name = "shined", version = VERSION, about = "shine supervisor daemon")]
struct Args {
    /// Path to prisms.json (defaults to the config directory).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn setup_logging() -> Result<()> {
    let log_path = paths::log_dir()?.join("shined.log");
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();
    Ok(())
}

/// Translate daemon signals into supervisor events.
fn spawn_signal_task(event_tx: UnboundedSender<SupervisorEvent>) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    log::info!("Received SIGHUP - reloading configuration");
                    if event_tx.send(SupervisorEvent::Reload).is_err() {
                        return;
                    }
                }
                _ = sigterm.recv() => {
                    let _ = event_tx.send(SupervisorEvent::Shutdown);
                    return;
                }
                _ = sigint.recv() => {
                    let _ = event_tx.send(SupervisorEvent::Shutdown);
                    return;
                }
            }
        }
    });
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    setup_logging()?;
    log::info!("shined v{VERSION} starting");

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    log::info!("Loading configuration from {}", config_path.display());

    let config = Config::load_from(&config_path)?;
    config.validate()?;
    log::info!("Loaded configuration with {} prism(s)", config.prisms.len());

    let state = DaemonStateWriter::create(&paths::shined_state()?)?;
    let controller_bin = find_controller_bin()?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (rpc_tx, mut rpc_rx) = mpsc::unbounded_channel::<RpcIncoming>();

    let server = RpcServer::start(paths::shined_socket()?, rpc_tx)?;

    // RPC frames and notifications feed the supervisor loop.
    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some((request, reply)) = rpc_rx.recv().await {
                if event_tx
                    .send(SupervisorEvent::Rpc { request, reply })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    spawn_signal_task(event_tx.clone())?;

    // Health ticker; the immediate first tick is skipped, panels were
    // just spawned.
    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if event_tx.send(SupervisorEvent::HealthTick).is_err() {
                    break;
                }
            }
        });
    }

    let mut supervisor = Supervisor::new(
        &config_path,
        config,
        controller_bin,
        state,
        event_tx.clone(),
    );
    supervisor
        .spawn_configured_panels()
        .await
        .context("failed to spawn configured panels")?;

    log::info!("shined is running");
    let result = supervisor.run(event_rx).await;

    server.shutdown();
    log::info!("shined stopped");
    result
}
