//! Signal handling for the controller.
//!
//! One task consumes SIGCHLD, SIGINT, SIGTERM, SIGHUP, and SIGWINCH and
//! translates them into [`ControllerEvent`]s. Reaping happens here —
//! `waitpid(-1, WNOHANG)` in a loop until nothing reapable remains — so a
//! burst of exits collapsed into one SIGCHLD still reaps every child.

use anyhow::{Context, Result};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::events::ControllerEvent;

/// Spawn the signal task.
///
/// The task exits after forwarding a shutdown-class signal; the event loop
/// does the actual teardown.
pub fn spawn_signal_task(event_tx: UnboundedSender<ControllerEvent>) -> Result<JoinHandle<()>> {
    let mut sigchld = signal(SignalKind::child()).context("Failed to register SIGCHLD")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP")?;
    let mut sigwinch =
        signal(SignalKind::window_change()).context("Failed to register SIGWINCH")?;

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigchld.recv() => {
                    for (pid, code) in reap_children() {
                        if event_tx.send(ControllerEvent::ChildExited { pid, code }).is_err() {
                            return;
                        }
                    }
                }
                _ = sigint.recv() => {
                    if event_tx.send(ControllerEvent::Interrupt).is_err() {
                        return;
                    }
                }
                _ = sigterm.recv() => {
                    let _ = event_tx.send(ControllerEvent::Shutdown);
                    return;
                }
                _ = sighup.recv() => {
                    let _ = event_tx.send(ControllerEvent::Shutdown);
                    return;
                }
                _ = sigwinch.recv() => {
                    if event_tx.send(ControllerEvent::Resize).is_err() {
                        return;
                    }
                }
            }
        }
    });

    Ok(handle)
}

/// Drain every reapable child, classifying each exit.
///
/// Normal exit keeps its code; a signalled death maps to `128 + signo`.
pub fn reap_children() -> Vec<(i32, i32)> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                log::info!("Child {pid} exited with code {code}");
                reaped.push((pid.as_raw(), code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _core)) => {
                log::info!("Child {pid} terminated by signal {sig}");
                reaped.push((pid.as_raw(), 128 + sig as i32));
            }
            // Stopped/continued children are not exits; keep draining.
            Ok(WaitStatus::Stopped(..) | WaitStatus::Continued(..)) => continue,
            // StillAlive, ECHILD, or anything else: nothing left to reap.
            _ => break,
        }
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    // Serializes the reaping tests: waitpid(-1) drains any child of the
    // test process, so concurrent reap tests would steal each other's
    // children.
    static REAP_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_reap_children_drains_multiple_exits() {
        let _guard = REAP_LOCK.lock().unwrap();
        // Spawn three short-lived children, wait for them to die, then
        // verify one drain pass collects them all.
        let pids: Vec<i32> = (0..3)
            .map(|_| {
                Command::new("/bin/true")
                    .spawn()
                    .expect("spawn /bin/true")
                    .id() as i32
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(300));

        let reaped = reap_children();
        for pid in pids {
            assert!(
                reaped.iter().any(|(p, code)| *p == pid && *code == 0),
                "pid {pid} not reaped: {reaped:?}"
            );
        }
    }

    #[test]
    fn test_reap_classifies_nonzero_exit() {
        let _guard = REAP_LOCK.lock().unwrap();
        let pid = Command::new("/bin/sh")
            .args(["-c", "exit 7"])
            .spawn()
            .expect("spawn sh")
            .id() as i32;

        std::thread::sleep(std::time::Duration::from_millis(300));

        let reaped = reap_children();
        let found = reaped.iter().find(|(p, _)| *p == pid);
        assert_eq!(found.map(|(_, code)| *code), Some(7));
    }
}
