//! The supervisor: spawns one panel controller per configured prism,
//! watches their health, applies restart policy, and serves the
//! aggregation RPC.
//!
//! # Event loop
//!
//! Like the controller, the supervisor serializes every mutation through
//! one event channel: RPC frames, health ticks, delayed respawns, and
//! signals all land in [`Supervisor::run`]. Restart delays never block the
//! loop — the decision spawns a sleep task that posts a respawn event when
//! the delay elapses, carrying the descriptor with it so counters and
//! config survive the gap.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::config::{Config, PrismConfig};
use crate::ipc::IpcClient;
use crate::restart::{should_restart_on_crash, CrashTracker};
use crate::rpc::{
    ConfigReloadResult, PanelInfo, PanelKillParams, PanelKillResult, PanelListResult,
    PanelSpawnParams, PanelSpawnResult, RpcRequest, RpcResponse, ServiceStatusResult,
    INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
};
use crate::state::{DaemonStateWriter, PanelSnapshot};

/// How long to wait for a freshly spawned controller to create its socket.
const SOCKET_WAIT: Duration = Duration::from_secs(5);
const SOCKET_POLL: Duration = Duration::from_millis(100);

/// Health check cadence.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// One spawned panel.
pub struct Panel {
    pub instance: String,
    pub name: String,
    pub pid: i32,
    pub socket_path: PathBuf,
    pub config: PrismConfig,
    pub healthy: bool,
    pub started_at_ms: i64,
    /// Spawned process handle, reaped on kill or crash detection.
    child: Option<Child>,
}

impl Panel {
    fn info(&self) -> PanelInfo {
        PanelInfo {
            instance: self.instance.clone(),
            name: self.name.clone(),
            pid: self.pid,
            socket: self.socket_path.display().to_string(),
            healthy: self.healthy,
        }
    }
}

/// Event delivered to the supervisor loop.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// An RPC frame; `reply` is `None` for notifications.
    Rpc {
        request: RpcRequest,
        reply: Option<oneshot::Sender<RpcResponse>>,
    },
    /// Periodic health check.
    HealthTick,
    /// A crashed panel's restart delay elapsed.
    RespawnPanel {
        instance: String,
        config: PrismConfig,
    },
    /// A stopped or crashed prism's restart delay elapsed; re-start it
    /// inside its (still running) panel.
    RestartPrism { panel: String, name: String },
    /// SIGHUP or `config/reload`.
    Reload,
    /// SIGTERM/SIGINT.
    Shutdown,
}

/// Compute the reload set difference by prism name.
///
/// Returns `(to_kill, to_spawn)`: live names absent from the new config,
/// and new names with no live panel. Existing panels are left untouched.
pub fn diff_panels(current: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
    let new_set: HashSet<&str> = new.iter().map(String::as_str).collect();

    let to_kill = current
        .iter()
        .filter(|name| !new_set.contains(name.as_str()))
        .cloned()
        .collect();
    let to_spawn = new
        .iter()
        .filter(|name| !current_set.contains(name.as_str()))
        .cloned()
        .collect();
    (to_kill, to_spawn)
}

/// Locate the controller binary: `PATH` first, then next to our own
/// executable.
pub fn find_controller_bin() -> Result<PathBuf> {
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join("prismctl");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let candidate = exe
        .parent()
        .map(|dir| dir.join("prismctl"))
        .filter(|p| p.is_file());
    candidate.ok_or_else(|| anyhow!("prismctl not found in PATH or binary directory"))
}

pub struct Supervisor {
    config_path: PathBuf,
    config: Config,
    panels: HashMap<String, Panel>,
    /// Crash counters, preserved across respawns. Keyed by panel instance
    /// for panel-level crashes and `panel:name` for prism crashes.
    trackers: HashMap<String, CrashTracker>,
    controller_bin: PathBuf,
    state: DaemonStateWriter,
    started_at: Instant,
    event_tx: UnboundedSender<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(
        config_path: &Path,
        config: Config,
        controller_bin: PathBuf,
        state: DaemonStateWriter,
        event_tx: UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            config,
            panels: HashMap::new(),
            trackers: HashMap::new(),
            controller_bin,
            state,
            started_at: Instant::now(),
            event_tx,
        }
    }

    /// Spawn a panel for every configured prism. Startup fails if any
    /// panel cannot be brought up.
    pub async fn spawn_configured_panels(&mut self) -> Result<()> {
        let prisms = self.config.prisms.clone();
        for prism in prisms {
            let instance = prism.name.clone();
            log::info!(
                "Spawning panel for prism {} (instance {instance}, binary {})",
                prism.name,
                prism.path.display()
            );
            self.spawn_panel(&prism, &instance)
                .await
                .with_context(|| format!("failed to spawn panel for {}", prism.name))?;
        }
        Ok(())
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self, mut event_rx: UnboundedReceiver<SupervisorEvent>) -> Result<()> {
        while let Some(event) = event_rx.recv().await {
            match event {
                SupervisorEvent::Rpc { request, reply } => match reply {
                    Some(reply) => {
                        let response = self.handle_call(request).await;
                        let _ = reply.send(response);
                    }
                    None => self.handle_notification(request),
                },
                SupervisorEvent::HealthTick => self.monitor_panels().await,
                SupervisorEvent::RespawnPanel { instance, config } => {
                    log::info!("Respawning panel {instance}");
                    if let Err(e) = self.spawn_panel(&config, &instance).await {
                        log::error!("Failed to restart panel {instance}: {e:#}");
                    }
                }
                SupervisorEvent::RestartPrism { panel, name } => {
                    self.restart_prism(&panel, &name).await;
                }
                SupervisorEvent::Reload => {
                    if let Err(e) = self.reload().await {
                        log::error!("Failed to reload config: {e:#}");
                    }
                }
                SupervisorEvent::Shutdown => {
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Panel lifecycle
    // -----------------------------------------------------------------

    /// Spawn a panel through the external panel command (or directly when
    /// none is configured) and wait for its IPC socket to appear.
    pub async fn spawn_panel(&mut self, config: &PrismConfig, instance: &str) -> Result<()> {
        if self.panels.contains_key(instance) {
            return Ok(());
        }

        crate::paths::remove_stale_panel_files(instance);
        let socket_path = crate::paths::prism_socket(instance)?;

        let mut child = self
            .build_spawn_command(config, instance)
            .spawn()
            .with_context(|| format!("failed to spawn panel {instance}"))?;
        let pid = child.id() as i32;

        // The controller signals readiness by binding its socket.
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        while !socket_path.exists() {
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                bail!("controller socket not created within timeout: {instance}");
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }

        log::info!("Panel spawned: {instance} (pid {pid}, socket {})", socket_path.display());

        self.panels.insert(
            instance.to_string(),
            Panel {
                instance: instance.to_string(),
                name: config.name.clone(),
                pid,
                socket_path,
                config: config.clone(),
                healthy: true,
                started_at_ms: now_unix_ms(),
                child: Some(child),
            },
        );
        self.publish_state();
        Ok(())
    }

    fn build_spawn_command(&self, config: &PrismConfig, instance: &str) -> Command {
        if self.config.panel_command.is_empty() {
            // No emulator facility configured: run the controller directly.
            let mut cmd = Command::new(&self.controller_bin);
            cmd.arg(&config.name).arg(instance);
            cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
            return cmd;
        }

        let mut cmd = Command::new(&self.config.panel_command[0]);
        cmd.args(&self.config.panel_command[1..]);
        // Geometry hints are opaque to us; the panel command interprets them.
        if let Some(geometry) = &config.geometry {
            cmd.arg(format!("--geometry={geometry}"));
        }
        cmd.arg(&self.controller_bin)
            .arg(&config.name)
            .arg(instance);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }

    /// Stop a panel: graceful IPC stop, then kill the process if it
    /// lingers, then reap it.
    pub async fn kill_panel(&mut self, instance: &str) -> Result<()> {
        let mut panel = self
            .panels
            .remove(instance)
            .ok_or_else(|| anyhow!("panel {instance} not found"))?;

        let client = IpcClient::new(&panel.socket_path);
        if let Err(e) = client.stop().await {
            log::debug!("Graceful stop of {instance} failed: {e:#}");
        }

        if let Some(mut child) = panel.child.take() {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if tokio::time::Instant::now() >= deadline => {
                        log::warn!("Panel {instance} did not stop, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
                    Err(_) => break,
                }
            }
        }

        log::info!("Killed panel {instance}");
        self.publish_state();
        Ok(())
    }

    /// Health pass: a panel whose process died or whose IPC stopped
    /// answering is treated as crashed.
    async fn monitor_panels(&mut self) {
        let instances: Vec<String> = self.panels.keys().cloned().collect();
        let mut crashed = Vec::new();

        for instance in instances {
            let Some(panel) = self.panels.get_mut(&instance) else {
                continue;
            };
            let alive = match panel.child.as_mut().map(Child::try_wait) {
                Some(Ok(Some(status))) => {
                    log::warn!("Panel {instance} process exited: {status}");
                    false
                }
                _ => true,
            };

            let healthy = if alive {
                let socket_path = self.panels[&instance].socket_path.clone();
                IpcClient::new(&socket_path).ping().await.is_ok()
            } else {
                false
            };

            if healthy {
                if let Some(panel) = self.panels.get_mut(&instance) {
                    panel.healthy = true;
                }
            } else {
                log::warn!("Panel {instance} is not responsive");
                crashed.push(instance);
            }
        }

        for instance in crashed {
            self.handle_panel_crash(&instance);
        }
        self.publish_state();
    }

    /// A panel died. Consult the restart policy and maybe schedule a
    /// respawn after the configured delay.
    fn handle_panel_crash(&mut self, instance: &str) {
        let Some(mut panel) = self.panels.remove(instance) else {
            return;
        };
        if let Some(mut child) = panel.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }

        let tracker = self.trackers.entry(instance.to_string()).or_default();
        let count = tracker.record_crash(Instant::now());
        log::warn!("Panel {instance} crashed (crash count: {count})");

        let policy = panel.config.restart;
        let max = panel.config.max_restarts;
        if !should_restart_on_crash(policy, max, count) {
            if policy.restarts_on_crash() {
                log::warn!("Panel {instance} exceeded max_restarts ({max}), not restarting");
            }
            self.publish_state();
            return;
        }

        let delay = panel.config.restart_delay();
        log::info!("Restarting panel {instance} after {delay:?} delay");
        let event_tx = self.event_tx.clone();
        let instance = instance.to_string();
        let config = panel.config.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(SupervisorEvent::RespawnPanel { instance, config });
        });
        self.publish_state();
    }

    /// Re-start a prism inside its panel after a policy-driven delay.
    async fn restart_prism(&mut self, panel: &str, name: &str) {
        let Some(entry) = self.panels.get(panel) else {
            log::debug!("Panel {panel} gone before prism {name} restart");
            return;
        };
        if let Err(e) = IpcClient::new(&entry.socket_path).start(name).await {
            log::warn!("Failed to restart prism {name} in panel {panel}: {e:#}");
        } else {
            log::info!("Restarted prism {name} in panel {panel}");
        }
    }

    // -----------------------------------------------------------------
    // RPC calls
    // -----------------------------------------------------------------

    async fn handle_call(&mut self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);
        match request.method.as_str() {
            "panel/list" => {
                let result = PanelListResult {
                    panels: self.panel_infos(),
                };
                RpcResponse::success(id, serde_json::json!(result))
            }
            "panel/spawn" => self.handle_spawn(id, request.params).await,
            "panel/kill" => {
                let params: PanelKillParams = match parse_params(request.params) {
                    Ok(p) => p,
                    Err(e) => return RpcResponse::failure(id, INVALID_PARAMS, e.to_string()),
                };
                match self.kill_panel(&params.instance).await {
                    Ok(()) => {
                        self.trackers.remove(&params.instance);
                        RpcResponse::success(id, serde_json::json!(PanelKillResult { killed: true }))
                    }
                    Err(e) => RpcResponse::failure(id, INTERNAL_ERROR, format!("{e:#}")),
                }
            }
            "service/status" => {
                let result = ServiceStatusResult {
                    panels: self.panel_infos(),
                    uptime_ms: self.started_at.elapsed().as_millis() as i64,
                    version: crate::VERSION.to_string(),
                };
                RpcResponse::success(id, serde_json::json!(result))
            }
            "config/reload" => {
                log::info!("config/reload via RPC");
                let result = match self.reload().await {
                    Ok(()) => ConfigReloadResult {
                        reloaded: true,
                        errors: Vec::new(),
                    },
                    Err(e) => ConfigReloadResult {
                        reloaded: false,
                        errors: vec![format!("{e:#}")],
                    },
                };
                RpcResponse::success(id, serde_json::json!(result))
            }
            other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("unknown method: {other}")),
        }
    }

    async fn handle_spawn(
        &mut self,
        id: serde_json::Value,
        params: Option<serde_json::Value>,
    ) -> RpcResponse {
        let params: PanelSpawnParams = match parse_params(params) {
            Ok(p) => p,
            Err(e) => return RpcResponse::failure(id, INVALID_PARAMS, e.to_string()),
        };
        if let Err(e) = params.config.validate() {
            return RpcResponse::failure(id, INVALID_PARAMS, format!("{e:#}"));
        }

        let instance = params
            .instance
            .unwrap_or_else(|| params.config.name.clone());
        if self.panels.contains_key(&instance) {
            return RpcResponse::failure(
                id,
                INVALID_PARAMS,
                format!("panel instance {instance} already exists"),
            );
        }

        log::info!("panel/spawn: {instance} (prism {})", params.config.name);
        match self.spawn_panel(&params.config, &instance).await {
            Ok(()) => {
                let socket = self.panels[&instance].socket_path.display().to_string();
                RpcResponse::success(id, serde_json::json!(PanelSpawnResult { instance, socket }))
            }
            Err(e) => RpcResponse::failure(id, INTERNAL_ERROR, format!("{e:#}")),
        }
    }

    // -----------------------------------------------------------------
    // Controller notifications
    // -----------------------------------------------------------------

    fn handle_notification(&mut self, request: RpcRequest) {
        match request.method.as_str() {
            "prism/started" => {
                if let Ok(p) = parse_params::<crate::rpc::PrismStartedParams>(request.params) {
                    log::info!("[{}] prism started: {} (pid {})", p.panel, p.name, p.pid);
                    if let Some(panel) = self.panels.get_mut(&p.panel) {
                        panel.healthy = true;
                    }
                }
            }
            "prism/stopped" => {
                if let Ok(p) = parse_params::<crate::rpc::PrismStoppedParams>(request.params) {
                    log::info!("[{}] prism stopped: {} (exit={})", p.panel, p.name, p.exit_code);
                    self.handle_clean_exit(&p.panel, &p.name);
                }
            }
            "prism/crashed" => {
                if let Ok(p) = parse_params::<crate::rpc::PrismCrashedParams>(request.params) {
                    log::warn!(
                        "[{}] prism crashed: {} (exit={}, signal={})",
                        p.panel,
                        p.name,
                        p.exit_code,
                        p.signal
                    );
                    self.handle_prism_crash(&p.panel, &p.name);
                }
            }
            "foreground/changed" => {
                if let Ok(p) = parse_params::<crate::rpc::ForegroundChangedParams>(request.params) {
                    log::info!("[{}] foreground changed: {} -> {}", p.panel, p.from, p.to);
                }
            }
            other => log::debug!("Ignoring unknown notification: {other}"),
        }
    }

    /// A prism exited cleanly. Only the `always` policy brings it back;
    /// clean exits never touch the crash counters.
    fn handle_clean_exit(&mut self, panel: &str, name: &str) {
        let Some(entry) = self.panels.get(panel) else {
            return;
        };
        if !entry.config.restart.restarts_on_clean_exit() {
            return;
        }
        let delay = entry.config.restart_delay();
        log::info!("Prism {name} exited cleanly; policy=always, restarting after {delay:?}");
        schedule_prism_restart(self.event_tx.clone(), panel, name, delay);
    }

    /// A prism crashed inside a live panel. Same policy table as panel
    /// crashes, tracked per prism.
    fn handle_prism_crash(&mut self, panel: &str, name: &str) {
        let Some(entry) = self.panels.get(panel) else {
            return;
        };
        let policy = entry.config.restart;
        let max = entry.config.max_restarts;
        let delay = entry.config.restart_delay();

        let key = format!("{panel}:{name}");
        let tracker = self.trackers.entry(key).or_default();
        let count = tracker.record_crash(Instant::now());

        if !should_restart_on_crash(policy, max, count) {
            if policy.restarts_on_crash() {
                log::warn!("Prism {name} exceeded max_restarts ({max}), not restarting");
            }
            return;
        }
        log::info!("Restarting prism {name} in panel {panel} after {delay:?} (crash {count})");
        schedule_prism_restart(self.event_tx.clone(), panel, name, delay);
    }

    // -----------------------------------------------------------------
    // Reload & shutdown
    // -----------------------------------------------------------------

    /// Re-parse and re-validate the config, then apply the set difference
    /// by prism name. A validation failure aborts without touching any
    /// live panel.
    pub async fn reload(&mut self) -> Result<()> {
        log::info!("Reloading configuration from {}", self.config_path.display());

        let new_config = Config::load_from(&self.config_path)?;
        new_config.validate()?;

        let current: Vec<String> = self.panels.values().map(|p| p.name.clone()).collect();
        let new: Vec<String> = new_config.prisms.iter().map(|p| p.name.clone()).collect();
        let (to_kill, to_spawn) = diff_panels(&current, &new);

        for name in to_kill {
            let instance = self
                .panels
                .values()
                .find(|p| p.name == name)
                .map(|p| p.instance.clone());
            if let Some(instance) = instance {
                log::info!("Removing panel {instance} (prism {name} no longer in config)");
                if let Err(e) = self.kill_panel(&instance).await {
                    log::warn!("Failed to kill panel {instance}: {e:#}");
                }
                self.trackers.remove(&instance);
            }
        }

        self.config = new_config;

        for name in to_spawn {
            let Some(prism) = self.config.prism(&name).cloned() else {
                continue;
            };
            log::info!("Adding panel for new prism {name}");
            if let Err(e) = self.spawn_panel(&prism, &name).await {
                log::warn!("Failed to spawn panel for {name}: {e:#}");
            }
        }

        log::info!("Configuration reloaded");
        Ok(())
    }

    async fn shutdown(&mut self) {
        log::info!("Stopping all panels");
        let instances: Vec<String> = self.panels.keys().cloned().collect();
        for instance in instances {
            if let Err(e) = self.kill_panel(&instance).await {
                log::warn!("Failed to stop panel {instance}: {e:#}");
            }
        }
        self.state.remove();
    }

    fn panel_infos(&self) -> Vec<PanelInfo> {
        let mut infos: Vec<PanelInfo> = self.panels.values().map(Panel::info).collect();
        infos.sort_by(|a, b| a.instance.cmp(&b.instance));
        infos
    }

    fn publish_state(&mut self) {
        let mut snapshots: Vec<PanelSnapshot> = self
            .panels
            .values()
            .map(|p| PanelSnapshot {
                instance: p.instance.clone(),
                name: p.name.clone(),
                pid: p.pid,
                healthy: p.healthy,
                start_unix_ms: p.started_at_ms,
            })
            .collect();
        snapshots.sort_by(|a, b| a.instance.cmp(&b.instance));
        self.state.publish(&snapshots);
    }
}

fn schedule_prism_restart(
    event_tx: UnboundedSender<SupervisorEvent>,
    panel: &str,
    name: &str,
    delay: Duration,
) {
    let panel = panel.to_string();
    let name = name.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = event_tx.send(SupervisorEvent::RestartPrism { panel, name });
    });
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T> {
    let params = params.ok_or_else(|| anyhow!("missing params"))?;
    serde_json::from_value(params).map_err(|e| anyhow!("invalid params: {e}"))
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
