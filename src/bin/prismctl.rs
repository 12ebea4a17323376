//! Panel controller binary.
//!
//! Spawned by the supervisor inside a terminal emulator window, with the
//! window's PTY on stdin/stdout. Hosts prisms for one panel: the named
//! prism is started in the foreground immediately, and further prisms
//! come and go via the panel's IPC socket.
//!
//! Exit codes: 0 clean shutdown, 1 startup failure, 2 invalid arguments
//! (from argument parsing).

use std::os::fd::AsFd;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use tokio::sync::mpsc;

use shine::config::Config;
use shine::controller::{
    spawn_ipc_forwarder, signals::spawn_signal_task, stdio_real_pty, Controller,
};
use shine::ipc::IpcServer;
use shine::rpc::Notifier;
use shine::state::PanelStateWriter;
use shine::{paths, VERSION};

#[derive(Parser)]
#[command(
    name = "prismctl",
    version = VERSION,
    about = "Panel controller: multiplexes prisms inside one terminal panel"
)]
struct Args {
    /// Prism to start in the foreground.
    prism_name: String,
    /// Panel instance name; defaults to the prism name.
    instance_name: Option<String>,
}

/// Restores the real PTY's termios on drop, however we exit.
struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    fn new() -> Result<Self> {
        let stdin = std::io::stdin();
        let original = tcgetattr(stdin.as_fd()).context("stdin is not a terminal")?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)
            .context("Failed to put the real PTY into raw mode")?;
        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        let _ = tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &self.original);
    }
}

fn setup_logging(instance: &str) -> Result<()> {
    let log_path = paths::log_dir()?.join(format!("prismctl-{instance}.log"));
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;
    // Logs go to a file so PTY traffic on stdout stays clean.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();
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
    let instance = args
        .instance_name
        .clone()
        .unwrap_or_else(|| args.prism_name.clone());

    setup_logging(&instance)?;
    log::info!("prismctl v{VERSION} starting (panel {instance})");

    if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
        bail!("stdin is not a terminal; prismctl must run inside a panel window");
    }

    let config = Config::load_from(&Config::default_path()?)?;
    config.validate()?;
    if config.prism(&args.prism_name).is_none() {
        bail!("prism {:?} is not configured", args.prism_name);
    }

    // A crashed predecessor may have left its socket behind.
    paths::remove_stale_panel_files(&instance);

    let raw_guard = RawModeGuard::new()?;

    let state = PanelStateWriter::create(&paths::prism_state(&instance)?)?;
    let (real_in, real_out) = stdio_real_pty()?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (ipc_tx, ipc_rx) = mpsc::unbounded_channel();

    let server = IpcServer::start(paths::prism_socket(&instance)?, ipc_tx)?;
    spawn_ipc_forwarder(ipc_rx, event_tx.clone());
    spawn_signal_task(event_tx.clone())?;

    let mut controller = Controller::new(
        &instance,
        config,
        real_in,
        real_out,
        state,
        Notifier::new(&instance),
    );

    if let Err(e) = controller.start_prism(&args.prism_name) {
        server.shutdown();
        return Err(e).context("failed to start initial prism");
    }

    let result = controller.run(event_rx).await;

    server.shutdown();
    drop(raw_guard);

    log::info!("prismctl stopped (panel {instance})");
    result
}
