//! The panel controller: MRU bookkeeping, the swap engine, child
//! lifecycle, and shutdown.
//!
//! # Architecture
//!
//! ```text
//! IpcServer ──┐
//! signal task ├─ ControllerEvent ──► Controller::run ── MRU / Mirror / state region
//! reaping  ───┘
//! ```
//!
//! The event loop is the single serialization point for every state
//! mutation. The only parallel actors are the mirror's two copy tasks,
//! which touch file handles and nothing else.
//!
//! # The swap hot path
//!
//! Given a target already in the MRU: deactivate the old mirror (never
//! waits), move the target to the head, sync the real PTY's window size
//! onto it (one ioctl), activate a fresh mirror, and publish the state
//! region under its seq-lock. No buffered output is copied and no history
//! is replayed — the swap reveals the live screen of an already-running
//! program.

pub mod events;
pub mod signals;

pub use events::ControllerEvent;

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::ipc::{Action, IpcRequest, PrismStatus, Request, Response, StatusData};
use crate::mirror::{shared_fd, Mirror, SharedFd};
use crate::pty;
use crate::rpc::Notifier;
use crate::state::{PanelStateWriter, PrismSnapshot};

/// SIGTERM → SIGKILL escalation window for a single kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Bounded wait for children during graceful shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One live child prism. Owned exclusively by the controller; the master
/// fd closes when the instance drops out of the MRU.
pub struct PrismInstance {
    pub name: String,
    pub pid: i32,
    pub master: OwnedFd,
    pub start_unix_ms: i64,
}

/// Wrap the controller's stdin/stdout — the real PTY the terminal
/// emulator attached us to — for mirror use.
pub fn stdio_real_pty() -> Result<(SharedFd, SharedFd)> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let input = shared_fd(pty::dup_nonblocking(stdin.as_fd()).context("Failed to dup stdin")?)?;
    let output = shared_fd(pty::dup_nonblocking(stdout.as_fd()).context("Failed to dup stdout")?)?;
    Ok((input, output))
}

/// Forward decoded IPC requests into the controller event channel.
pub fn spawn_ipc_forwarder(
    mut ipc_rx: UnboundedReceiver<IpcRequest>,
    event_tx: UnboundedSender<ControllerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((request, reply)) = ipc_rx.recv().await {
            if event_tx
                .send(ControllerEvent::Ipc { request, reply })
                .is_err()
            {
                break;
            }
        }
    })
}

/// The per-panel controller.
pub struct Controller {
    instance: String,
    config: Config,
    /// Head = foreground. Single source of truth for visibility.
    mru: Vec<PrismInstance>,
    mirror: Option<Mirror>,
    real_in: SharedFd,
    real_out: SharedFd,
    state: PanelStateWriter,
    notifier: Notifier,
    /// pid → name for head-kills, where the MRU entry is gone before the
    /// reap arrives but the exit still needs classifying.
    pending_exits: HashMap<i32, String>,
    stop_requested: bool,
}

impl Controller {
    pub fn new(
        instance: &str,
        config: Config,
        real_in: SharedFd,
        real_out: SharedFd,
        state: PanelStateWriter,
        notifier: Notifier,
    ) -> Self {
        Self {
            instance: instance.to_string(),
            config,
            mru: Vec::new(),
            mirror: None,
            real_in,
            real_out,
            state,
            notifier,
            pending_exits: HashMap::new(),
            stop_requested: false,
        }
    }

    /// Run the event loop until shutdown.
    ///
    /// The IPC listener is owned by the caller and should be shut down
    /// once this returns.
    pub async fn run(mut self, mut event_rx: UnboundedReceiver<ControllerEvent>) -> Result<()> {
        while let Some(event) = event_rx.recv().await {
            match event {
                ControllerEvent::Ipc { request, reply } => {
                    let response = self.handle_request(request);
                    let _ = reply.send(response);
                }
                ControllerEvent::ChildExited { pid, code } => {
                    self.handle_child_exit(pid, code);
                }
                ControllerEvent::Interrupt => {
                    if let Some(head) = self.mru.first().map(|p| p.name.clone()) {
                        log::info!("Ctrl+C: killing foreground prism: {head}");
                        if let Err(e) = self.kill_prism(&head) {
                            log::warn!("Failed to kill foreground prism: {e:#}");
                        }
                    } else {
                        log::info!("Ctrl+C: no prisms running, shutting down");
                        self.shutdown(true).await;
                        return Ok(());
                    }
                }
                ControllerEvent::Shutdown => {
                    self.shutdown(true).await;
                    return Ok(());
                }
                ControllerEvent::Resize => self.propagate_resize(),
            }

            if self.stop_requested {
                self.shutdown(true).await;
                return Ok(());
            }
        }
        // Event channel closed without an explicit stop.
        self.shutdown(false).await;
        Ok(())
    }

    /// Dispatch one IPC request. Pure state machine — nothing here blocks.
    fn handle_request(&mut self, request: Request) -> Response {
        match request.action {
            Action::Start => match request.prism.as_deref() {
                Some(name) => match self.start_prism(name) {
                    Ok(()) => Response::ok(format!("started {name}")),
                    Err(e) => Response::error(format!("{e:#}")),
                },
                None => Response::error("start requires a prism name"),
            },
            Action::Kill => match request.prism.as_deref() {
                Some(name) => match self.kill_prism(name) {
                    Ok(()) => Response::ok(format!("killed {name}")),
                    Err(e) => Response::error(format!("{e:#}")),
                },
                None => Response::error("kill requires a prism name"),
            },
            Action::Status => match serde_json::to_value(self.status_data()) {
                Ok(data) => Response::ok_with_data("ok", data),
                Err(e) => Response::error(format!("{e}")),
            },
            Action::List => {
                let names: Vec<&str> = self.mru.iter().map(|p| p.name.as_str()).collect();
                match serde_json::to_value(names) {
                    Ok(data) => Response::ok_with_data("ok", data),
                    Err(e) => Response::error(format!("{e}")),
                }
            }
            Action::Stop => {
                self.stop_requested = true;
                Response::ok("shutting down")
            }
        }
    }

    /// Start a prism, or foreground it if already running.
    pub fn start_prism(&mut self, name: &str) -> Result<()> {
        if let Some(idx) = self.mru.iter().position(|p| p.name == name) {
            if idx == 0 {
                // Already foreground. Re-activate the mirror only if a
                // prior deactivation left it down; a healthy one is kept,
                // so repeated starts leak neither tasks nor fds.
                if self.mirror.as_ref().map_or(true, |m| !m.is_active()) {
                    let head = self.mru[0].name.clone();
                    self.swap(&head);
                }
                return Ok(());
            }
            let from = self.foreground_name();
            let inst = self.mru.remove(idx);
            self.mru.insert(0, inst);
            self.swap(&from);
            return Ok(());
        }

        let descriptor = self
            .config
            .prism(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown prism: {name}"))?;

        let pair = pty::allocate().context("Failed to allocate PTY")?;
        // Child starts at the real PTY's current size.
        if let Err(e) = pty::sync_size(self.real_fd(), pair.master.as_raw_fd()) {
            log::debug!("Initial size sync failed: {e:#}");
        }

        // A spawn failure surfaces on this request and leaves the MRU
        // untouched; the allocated pair closes on drop.
        let pid = pty::spawn_prism(&descriptor.path, &descriptor.args, pair.slave)?;

        log::info!("Started prism {name} (pid {pid})");

        let from = self.foreground_name();
        self.mru.insert(
            0,
            PrismInstance {
                name: name.to_string(),
                pid,
                master: pair.master,
                start_unix_ms: now_unix_ms(),
            },
        );
        self.swap(&from);
        self.notifier.prism_started(name, pid);
        Ok(())
    }

    /// Terminate a prism by name.
    pub fn kill_prism(&mut self, name: &str) -> Result<()> {
        let idx = self
            .mru
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| anyhow!("no such prism: {name}"))?;

        if idx == 0 {
            if let Some(mut mirror) = self.mirror.take() {
                mirror.deactivate();
            }
            let inst = self.mru.remove(0);
            self.pending_exits.insert(inst.pid, inst.name.clone());
            terminate_with_grace(inst.pid);
            let from = inst.name.clone();
            drop(inst); // closes the master
            self.swap(&from);
        } else {
            // Background prism: no mirror involvement. MRU removal and
            // master close happen on reap.
            terminate_with_grace(self.mru[idx].pid);
        }
        Ok(())
    }

    /// A reaped child arrived from the signal task.
    fn handle_child_exit(&mut self, pid: i32, code: i32) {
        if let Some(idx) = self.mru.iter().position(|p| p.pid == pid) {
            let was_head = idx == 0;
            let inst = self.mru.remove(idx); // closes the master on drop
            log::info!("Prism {} (pid {pid}) exited with code {code}", inst.name);

            if was_head {
                if let Some(mut mirror) = self.mirror.take() {
                    mirror.deactivate();
                }
                // Promote the next most recent prism, if any.
                self.swap(&inst.name);
            } else {
                self.publish_state();
            }
            self.notify_exit(&inst.name, code);
        } else if let Some(name) = self.pending_exits.remove(&pid) {
            log::debug!("Reaped killed prism {name} (pid {pid}, code {code})");
            self.notify_exit(&name, code);
        } else {
            log::debug!("Reaped unknown pid {pid} (code {code})");
        }
    }

    /// The swap hot path. The caller has already updated the MRU; `from`
    /// names the previous foreground for the change notification.
    fn swap(&mut self, from: &str) {
        if let Some(mut mirror) = self.mirror.take() {
            mirror.deactivate();
        }

        if let Some(head) = self.mru.first() {
            if let Err(e) = pty::sync_size(self.real_fd(), head.master.as_raw_fd()) {
                log::debug!("Size sync on swap failed: {e:#}");
            }
            match Mirror::activate(
                Arc::clone(&self.real_in),
                Arc::clone(&self.real_out),
                head.master.as_fd(),
            ) {
                Ok(mirror) => self.mirror = Some(mirror),
                Err(e) => log::error!("Failed to activate mirror: {e:#}"),
            }
        }

        self.publish_state();

        let to = self.foreground_name();
        if from != to {
            self.notifier.foreground_changed(from, &to);
        }
    }

    /// Propagate the real PTY's size to every child, best-effort per child.
    pub fn propagate_resize(&self) {
        let ws = match pty::window_size(self.real_fd()) {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("Failed to read real PTY size: {e:#}");
                return;
            }
        };
        for inst in &self.mru {
            if let Err(e) = pty::set_window_size(inst.master.as_raw_fd(), &ws) {
                log::debug!("Resize propagation to {} failed: {e:#}", inst.name);
            }
        }
    }

    /// Deactivate, terminate all children, optionally wait, release
    /// everything.
    async fn shutdown(&mut self, graceful: bool) {
        log::info!("Shutting down panel {}", self.instance);

        if let Some(mut mirror) = self.mirror.take() {
            mirror.deactivate();
        }

        for inst in &self.mru {
            let _ = kill(Pid::from_raw(inst.pid), Signal::SIGTERM);
        }

        if graceful && !self.mru.is_empty() {
            let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
            while tokio::time::Instant::now() < deadline {
                if self.mru.iter().all(|p| !crate::paths::pid_alive(p.pid)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            for inst in &self.mru {
                if crate::paths::pid_alive(inst.pid) {
                    log::warn!("Prism {} survived SIGTERM, sending SIGKILL", inst.name);
                    let _ = kill(Pid::from_raw(inst.pid), Signal::SIGKILL);
                }
            }
        }

        self.mru.clear(); // closes every master
        self.state.remove();
    }

    fn status_data(&self) -> StatusData {
        StatusData {
            foreground: self.foreground_name(),
            background: self.mru.iter().skip(1).map(|p| p.name.clone()).collect(),
            prisms: self
                .mru
                .iter()
                .enumerate()
                .map(|(i, p)| PrismStatus {
                    name: p.name.clone(),
                    pid: p.pid,
                    state: (if i == 0 { "foreground" } else { "background" }).to_string(),
                })
                .collect(),
        }
    }

    fn publish_state(&mut self) {
        self.check_mru_invariants();
        let snapshots: Vec<PrismSnapshot> = self
            .mru
            .iter()
            .enumerate()
            .map(|(i, p)| PrismSnapshot {
                name: p.name.clone(),
                pid: p.pid,
                start_unix_ms: p.start_unix_ms,
                foreground: i == 0,
            })
            .collect();
        let foreground = self.foreground_name();
        self.state.publish(&foreground, &snapshots);
    }

    /// Every live child appears exactly once. A violation means the
    /// controller's state is corrupt; abort and let the supervisor respawn.
    fn check_mru_invariants(&self) {
        let mut names = std::collections::HashSet::new();
        let mut pids = std::collections::HashSet::new();
        for inst in &self.mru {
            assert!(
                names.insert(inst.name.as_str()) && pids.insert(inst.pid),
                "MRU corrupt: duplicate entry for {} (pid {})",
                inst.name,
                inst.pid
            );
        }
    }

    fn foreground_name(&self) -> String {
        self.mru.first().map(|p| p.name.clone()).unwrap_or_default()
    }

    fn real_fd(&self) -> std::os::fd::RawFd {
        self.real_in.get_ref().as_raw_fd()
    }

    fn notify_exit(&self, name: &str, code: i32) {
        if code == 0 {
            self.notifier.prism_stopped(name, 0);
        } else {
            let signal = if code > 128 { code - 128 } else { 0 };
            self.notifier.prism_crashed(name, code, signal);
        }
    }

    /// Names in MRU order (test observability).
    #[must_use]
    pub fn mru_names(&self) -> Vec<String> {
        self.mru.iter().map(|p| p.name.clone()).collect()
    }

    /// Raw master fds in MRU order (diagnostics).
    #[must_use]
    pub fn master_fds(&self) -> Vec<std::os::fd::RawFd> {
        self.mru.iter().map(|p| p.master.as_raw_fd()).collect()
    }

    /// Whether a mirror is currently bound.
    #[must_use]
    pub fn mirror_active(&self) -> bool {
        self.mirror.as_ref().is_some_and(Mirror::is_active)
    }
}

/// SIGTERM now, SIGKILL from a detached task if the child survives the
/// grace period.
fn terminate_with_grace(pid: i32) {
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        log::warn!("SIGTERM to {pid} failed: {e}");
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(KILL_GRACE).await;
        if crate::paths::pid_alive(pid) {
            log::warn!("Child {pid} survived SIGTERM, escalating to SIGKILL");
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    });
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
