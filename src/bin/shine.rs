//! Operator CLI.
//!
//! Panel-scope commands talk to a controller's IPC socket; daemon-scope
//! commands talk to the supervisor's RPC socket. `status` reads the mmap
//! state region first and falls back to IPC when a consistent read can't
//! be had.

use anyhow::Result;
use clap::{Parser, Subcommand};

use shine::ipc::IpcClient;
use shine::rpc::RpcClient;
use shine::state::PanelStateReader;
use shine::{paths, VERSION};

#[derive(Parser)]
#[command(name = "shine", version = VERSION, about = "shine operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a panel's foreground and background prisms.
    Status { instance: String },
    /// List a panel's prisms in most-recently-used order.
    List { instance: String },
    /// Start a prism, or swap it to the foreground.
    Start { instance: String, prism: String },
    /// Kill a prism.
    Kill { instance: String, prism: String },
    /// Stop a panel controller.
    Stop { instance: String },
    /// List panels registered with the supervisor.
    Panels,
    /// Show supervisor status.
    ServiceStatus,
    /// Ask the supervisor to reload its configuration.
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Status { instance } => status(&instance).await?,
        Commands::List { instance } => {
            let client = IpcClient::new(&paths::prism_socket(&instance)?);
            for name in client.list().await? {
                println!("{name}");
            }
        }
        Commands::Start { instance, prism } => {
            IpcClient::new(&paths::prism_socket(&instance)?)
                .start(&prism)
                .await?;
            println!("started {prism}");
        }
        Commands::Kill { instance, prism } => {
            IpcClient::new(&paths::prism_socket(&instance)?)
                .kill(&prism)
                .await?;
            println!("killed {prism}");
        }
        Commands::Stop { instance } => {
            IpcClient::new(&paths::prism_socket(&instance)?).stop().await?;
            println!("stopped {instance}");
        }
        Commands::Panels => {
            let result = RpcClient::new(&paths::shined_socket()?)
                .call("panel/list", None)
                .await?;
            let list: shine::rpc::PanelListResult = serde_json::from_value(result)?;
            for panel in list.panels {
                println!(
                    "{}\t{}\tpid={}\thealthy={}",
                    panel.instance, panel.name, panel.pid, panel.healthy
                );
            }
        }
        Commands::ServiceStatus => {
            let result = RpcClient::new(&paths::shined_socket()?)
                .call("service/status", None)
                .await?;
            let status: shine::rpc::ServiceStatusResult = serde_json::from_value(result)?;
            println!("shined v{} (up {}s)", status.version, status.uptime_ms / 1000);
            for panel in status.panels {
                println!(
                    "  {}\t{}\tpid={}\thealthy={}",
                    panel.instance, panel.name, panel.pid, panel.healthy
                );
            }
        }
        Commands::Reload => {
            let result = RpcClient::new(&paths::shined_socket()?)
                .call("config/reload", None)
                .await?;
            let reload: shine::rpc::ConfigReloadResult = serde_json::from_value(result)?;
            if reload.reloaded {
                println!("configuration reloaded");
            } else {
                anyhow::bail!("reload failed: {}", reload.errors.join("; "));
            }
        }
    }
    Ok(())
}

/// Panel status: mmap fast path, IPC fallback.
async fn status(instance: &str) -> Result<()> {
    if let Ok(reader) = PanelStateReader::open(&paths::prism_state(instance)?) {
        match reader.read() {
            Ok(snapshot) => {
                print_status(
                    &snapshot.foreground,
                    snapshot
                        .prisms
                        .iter()
                        .map(|p| (p.name.as_str(), p.pid, p.foreground)),
                );
                return Ok(());
            }
            Err(e) => log::warn!("state region read failed, falling back to IPC: {e:#}"),
        }
    }

    let data = IpcClient::new(&paths::prism_socket(instance)?)
        .status()
        .await?;
    print_status(
        &data.foreground,
        data.prisms
            .iter()
            .map(|p| (p.name.as_str(), p.pid, p.state == "foreground")),
    );
    Ok(())
}

fn print_status<'a>(foreground: &str, prisms: impl Iterator<Item = (&'a str, i32, bool)>) {
    if foreground.is_empty() {
        println!("foreground: (none)");
    } else {
        println!("foreground: {foreground}");
    }
    for (name, pid, is_foreground) in prisms {
        let state = if is_foreground { "foreground" } else { "background" };
        println!("  {name}\tpid={pid}\t{state}");
    }
}
