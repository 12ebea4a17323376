//! Controller integration tests.
//!
//! Each test builds a controller around a scratch PTY pair standing in for
//! the real PTY, drives it through its event channel, and observes results
//! through IPC responses, the mmap state region, and the PTYs themselves.
//!
//! Reaping is driven manually: tests `waitpid` the specific child and post
//! `ChildExited`, because a process-wide SIGCHLD drain would steal exits
//! across parallel tests.

use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use shine::config::{Config, PrismConfig};
use shine::controller::{Controller, ControllerEvent};
use shine::ipc::{Action, Request, Response, StatusData};
use shine::mirror::{shared_fd, SharedFd};
use shine::pty;
use shine::rpc::Notifier;
use shine::state::{PanelStateReader, PanelStateWriter};

struct Fixture {
    event_tx: mpsc::UnboundedSender<ControllerEvent>,
    /// Keeps the real PTY's slave side open for the duration of the test.
    real: pty::PtyPair,
    state_path: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

fn descriptor(name: &str, path: &str, args: &[&str]) -> PrismConfig {
    PrismConfig {
        name: name.to_string(),
        path: path.into(),
        args: args.iter().map(|s| s.to_string()).collect(),
        restart: Default::default(),
        restart_delay_ms: 1000,
        max_restarts: 0,
        geometry: None,
    }
}

/// A config with three cat prisms and one self-terminating prism.
fn test_config() -> Config {
    Config {
        prisms: vec![
            descriptor("alpha", "/bin/cat", &[]),
            descriptor("beta", "/bin/cat", &[]),
            descriptor("gamma", "/bin/cat", &[]),
            descriptor("oneshot", "/bin/sh", &["-c", "exit 0"]),
            descriptor("failing", "/bin/sh", &["-c", "exit 3"]),
            descriptor(
                "counter",
                "/bin/sh",
                &["-c", "i=0; while :; do i=$((i+1)); echo $i; sleep 0.1; done"],
            ),
        ],
        panel_command: Vec::new(),
    }
}

fn real_pty() -> (SharedFd, SharedFd, pty::PtyPair) {
    let pair = pty::allocate().unwrap();
    // Raw mode, as prismctl sets it in production.
    let mut t = nix::sys::termios::tcgetattr(pair.slave.as_fd()).unwrap();
    nix::sys::termios::cfmakeraw(&mut t);
    nix::sys::termios::tcsetattr(pair.slave.as_fd(), nix::sys::termios::SetArg::TCSANOW, &t)
        .unwrap();
    // Tests read prism output back through the slave side.
    pty::set_nonblocking(pair.slave.as_raw_fd()).unwrap();
    let input = shared_fd(pty::dup_nonblocking(pair.master.as_fd()).unwrap()).unwrap();
    let output = shared_fd(pty::dup_nonblocking(pair.master.as_fd()).unwrap()).unwrap();
    (input, output, pair)
}

/// Build a controller and spawn its run loop.
fn start_controller() -> Fixture {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("panel.state");
    let state = PanelStateWriter::create(&state_path).unwrap();

    let (real_in, real_out, real) = real_pty();
    let controller = Controller::new(
        "test-panel",
        test_config(),
        real_in,
        real_out,
        state,
        Notifier::disabled(),
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(controller.run(event_rx));

    Fixture {
        event_tx,
        real,
        state_path,
        _tmp: tmp,
    }
}

async fn request(fixture: &Fixture, request: Request) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    fixture
        .event_tx
        .send(ControllerEvent::Ipc {
            request,
            reply: reply_tx,
        })
        .expect("controller gone");
    tokio::time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .expect("request timed out")
        .expect("reply dropped")
}

async fn start(fixture: &Fixture, name: &str) -> Response {
    request(fixture, Request::with_prism(Action::Start, name)).await
}

async fn status(fixture: &Fixture) -> StatusData {
    let response = request(fixture, Request::new(Action::Status)).await;
    assert!(response.success, "status failed: {}", response.message);
    serde_json::from_value(response.data.expect("no status data")).expect("bad status payload")
}

/// Blockingly wait for a specific child to exit and post the classified
/// result, as the signal task would.
async fn reap_and_post(fixture: &Fixture, pid: i32) {
    let event_tx = fixture.event_tx.clone();
    tokio::task::spawn_blocking(move || {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc != pid {
            return;
        }
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            0
        };
        let _ = event_tx.send(ControllerEvent::ChildExited { pid, code });
    })
    .await
    .unwrap();
}

async fn kill_and_reap(fixture: &Fixture, name: &str, pid: i32) {
    let response = request(fixture, Request::with_prism(Action::Kill, name)).await;
    assert!(response.success, "kill failed: {}", response.message);
    reap_and_post(fixture, pid).await;
}

/// Drain all prisms so shutdown doesn't spend its grace period waiting on
/// zombies nobody reaps.
async fn drain_and_stop(fixture: &Fixture) {
    loop {
        let snapshot = status(fixture).await;
        let Some(prism) = snapshot.prisms.first().map(|p| (p.name.clone(), p.pid)) else {
            break;
        };
        kill_and_reap(fixture, &prism.0, prism.1).await;
    }
    let response = request(fixture, Request::new(Action::Stop)).await;
    assert!(response.success);
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_hot_swap_two_prisms() {
    // Start two prisms, swap between them, observe MRU ordering.
    let fixture = start_controller();

    assert!(start(&fixture, "alpha").await.success);
    assert!(start(&fixture, "beta").await.success);

    let snapshot = status(&fixture).await;
    assert_eq!(snapshot.foreground, "beta");
    assert_eq!(snapshot.background, vec!["alpha".to_string()]);

    let swap_started = std::time::Instant::now();
    assert!(start(&fixture, "alpha").await.success);
    let elapsed = swap_started.elapsed();
    assert!(elapsed < Duration::from_millis(50), "swap took {elapsed:?}");

    let snapshot = status(&fixture).await;
    assert_eq!(snapshot.foreground, "alpha");
    assert_eq!(snapshot.background, vec!["beta".to_string()]);

    drain_and_stop(&fixture).await;
}

#[tokio::test]
async fn test_start_is_idempotent_on_foreground() {
    // Starting the current head is a no-op on the MRU.
    let fixture = start_controller();

    assert!(start(&fixture, "alpha").await.success);
    let before = status(&fixture).await;

    for _ in 0..3 {
        assert!(start(&fixture, "alpha").await.success);
    }

    let after = status(&fixture).await;
    assert_eq!(after.foreground, before.foreground);
    assert_eq!(after.prisms.len(), 1);
    assert_eq!(after.prisms[0].pid, before.prisms[0].pid, "prism was respawned");

    drain_and_stop(&fixture).await;
}

#[tokio::test]
async fn test_unknown_prism_start_and_kill() {
    let fixture = start_controller();

    let response = start(&fixture, "nonexistent").await;
    assert!(!response.success);
    assert!(response.message.contains("unknown prism"), "got: {}", response.message);

    // Kill of an unknown name errors and leaves the controller unchanged.
    let response = request(&fixture, Request::with_prism(Action::Kill, "ghost")).await;
    assert!(!response.success);

    let snapshot = status(&fixture).await;
    assert!(snapshot.prisms.is_empty());
    assert_eq!(snapshot.foreground, "");

    let response = request(&fixture, Request::new(Action::Stop)).await;
    assert!(response.success);
}

#[tokio::test]
async fn test_mru_uniqueness_through_churn() {
    // Arbitrary start sequences never duplicate an MRU entry.
    let fixture = start_controller();

    for name in ["alpha", "beta", "gamma", "beta", "alpha", "gamma", "alpha"] {
        assert!(start(&fixture, name).await.success);
    }

    let snapshot = status(&fixture).await;
    assert_eq!(snapshot.prisms.len(), 3);
    let mut names: Vec<&str> = snapshot.prisms.iter().map(|p| p.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), 3, "duplicate MRU entries: {:?}", snapshot.prisms);
    assert_eq!(snapshot.foreground, "alpha");

    drain_and_stop(&fixture).await;
}

#[tokio::test]
async fn test_kill_foreground_promotes_next() {
    let fixture = start_controller();

    assert!(start(&fixture, "alpha").await.success);
    assert!(start(&fixture, "beta").await.success);
    let beta_pid = status(&fixture).await.prisms[0].pid;

    kill_and_reap(&fixture, "beta", beta_pid).await;

    let snapshot = status(&fixture).await;
    assert_eq!(snapshot.foreground, "alpha");
    assert!(snapshot.background.is_empty());

    drain_and_stop(&fixture).await;
}

#[tokio::test]
async fn test_kill_background_removes_on_reap() {
    let fixture = start_controller();

    assert!(start(&fixture, "alpha").await.success);
    assert!(start(&fixture, "beta").await.success);

    let snapshot = status(&fixture).await;
    let alpha_pid = snapshot
        .prisms
        .iter()
        .find(|p| p.name == "alpha")
        .unwrap()
        .pid;

    kill_and_reap(&fixture, "alpha", alpha_pid).await;

    let snapshot = status(&fixture).await;
    assert_eq!(snapshot.foreground, "beta");
    assert!(snapshot.background.is_empty());
    assert_eq!(snapshot.prisms.len(), 1);

    drain_and_stop(&fixture).await;
}

#[tokio::test]
async fn test_child_exit_promotes_next() {
    // A foreground prism that dies on its own promotes the next in MRU.
    let fixture = start_controller();

    assert!(start(&fixture, "alpha").await.success);
    assert!(start(&fixture, "oneshot").await.success);
    let oneshot_pid = status(&fixture).await.prisms[0].pid;

    reap_and_post(&fixture, oneshot_pid).await;

    let snapshot = status(&fixture).await;
    assert_eq!(snapshot.foreground, "alpha");
    assert_eq!(snapshot.prisms.len(), 1);

    drain_and_stop(&fixture).await;
}

#[tokio::test]
async fn test_interrupt_kills_head_then_shuts_down() {
    // First Ctrl-C cancels the running prism, second exits the panel.
    let fixture = start_controller();

    assert!(start(&fixture, "alpha").await.success);
    let alpha_pid = status(&fixture).await.prisms[0].pid;

    fixture.event_tx.send(ControllerEvent::Interrupt).unwrap();
    reap_and_post(&fixture, alpha_pid).await;

    let snapshot = status(&fixture).await;
    assert!(snapshot.prisms.is_empty(), "controller should survive first SIGINT");
    assert_eq!(snapshot.foreground, "");

    // Second interrupt with an empty MRU shuts the controller down; the
    // state region is unlinked on the way out.
    fixture.event_tx.send(ControllerEvent::Interrupt).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while fixture.state_path.exists() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!fixture.state_path.exists(), "state region not removed on shutdown");
}

#[tokio::test]
async fn test_resize_propagates_to_all_children() {
    // SIGWINCH pushes the real PTY's size onto every child's master.
    // Drives the controller directly so each master can be inspected.
    let tmp = tempfile::TempDir::new().unwrap();
    let state = PanelStateWriter::create(&tmp.path().join("panel.state")).unwrap();
    let (real_in, real_out, real) = real_pty();
    let mut controller = Controller::new(
        "resize-panel",
        test_config(),
        real_in,
        real_out,
        state,
        Notifier::disabled(),
    );

    controller.start_prism("alpha").unwrap();
    controller.start_prism("beta").unwrap();
    controller.start_prism("gamma").unwrap();
    assert_eq!(controller.mru_names(), vec!["gamma", "beta", "alpha"]);
    assert!(controller.mirror_active());

    let ws = libc::winsize {
        ws_row: 50,
        ws_col: 120,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    pty::set_window_size(real.master.as_raw_fd(), &ws).unwrap();
    controller.propagate_resize();

    let masters = controller.master_fds();
    assert_eq!(masters.len(), 3);
    for fd in masters {
        let got = pty::window_size(fd).unwrap();
        assert_eq!((got.ws_row, got.ws_col), (50, 120));
    }
}

#[tokio::test]
async fn test_state_region_tracks_swaps() {
    // Property: the mmap region agrees with IPC status after each swap.
    let fixture = start_controller();

    assert!(start(&fixture, "alpha").await.success);
    assert!(start(&fixture, "beta").await.success);

    let reader = PanelStateReader::open(&fixture.state_path).unwrap();
    let snapshot = reader.read().unwrap();
    assert_eq!(snapshot.foreground, "beta");
    assert_eq!(snapshot.prisms.len(), 2);
    assert!(snapshot.prisms[0].foreground);
    assert_eq!(snapshot.prisms[0].name, "beta");

    assert!(start(&fixture, "alpha").await.success);
    let snapshot = reader.read().unwrap();
    assert_eq!(snapshot.foreground, "alpha");

    drain_and_stop(&fixture).await;
}

#[tokio::test]
async fn test_background_prism_keeps_running() {
    // A counter prism keeps producing while backgrounded; after the
    // swap back, the terminal sees integers well past the pre-swap value.
    let fixture = start_controller();

    assert!(start(&fixture, "counter").await.success);

    // Read a first batch of counter output from the real PTY.
    let first = read_integers_until(&fixture.real, 3, Duration::from_secs(5)).await;
    let last_before = *first.last().expect("no counter output before swap");

    // Hide the counter behind a cat prism for a second.
    assert!(start(&fixture, "alpha").await.success);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(start(&fixture, "counter").await.success);

    // The counter kept running while hidden: the numbers that now reach
    // the terminal (buffered plus live) must run well past the last one
    // seen before the swap.
    let after = read_integers_until_value(
        &fixture.real,
        last_before + 4,
        Duration::from_secs(10),
    )
    .await;
    assert!(
        after >= last_before + 4,
        "counter stalled while backgrounded: before={last_before}, after={after}"
    );

    drain_and_stop(&fixture).await;
}

/// Read integers from the real PTY until `count` have been seen.
async fn read_integers_until(real: &pty::PtyPair, count: usize, timeout: Duration) -> Vec<i64> {
    let mut seen = Vec::new();
    let mut text = String::new();
    let deadline = tokio::time::Instant::now() + timeout;
    while seen.len() < count && tokio::time::Instant::now() < deadline {
        append_output(real, &mut text).await;
        seen = parse_integers(&text);
    }
    seen
}

/// Read integers until one reaches `target`, returning the largest seen.
async fn read_integers_until_value(real: &pty::PtyPair, target: i64, timeout: Duration) -> i64 {
    let mut text = String::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        append_output(real, &mut text).await;
        let max = parse_integers(&text).into_iter().max().unwrap_or(0);
        if max >= target || tokio::time::Instant::now() >= deadline {
            return max;
        }
    }
}

async fn append_output(real: &pty::PtyPair, text: &mut String) {
    let mut buf = [0u8; 4096];
    match pty::read_fd(real.slave.as_raw_fd(), &mut buf) {
        Ok(n) if n > 0 => text.push_str(&String::from_utf8_lossy(&buf[..n])),
        _ => tokio::time::sleep(Duration::from_millis(20)).await,
    }
}

fn parse_integers(text: &str) -> Vec<i64> {
    text.split_whitespace()
        .filter_map(|tok| tok.trim().parse::<i64>().ok())
        .collect()
}
