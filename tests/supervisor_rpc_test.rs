//! Supervisor RPC surface, exercised over a real Unix socket with no
//! panels spawned.
//!
//! Runs as one sequential scenario because the runtime directory is
//! selected via a process-global environment variable.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use shine::config::Config;
use shine::rpc::{PanelListResult, RpcClient, RpcIncoming, RpcServer, ServiceStatusResult};
use shine::state::DaemonStateWriter;
use shine::supervisor::{Supervisor, SupervisorEvent};

#[tokio::test]
async fn test_rpc_surface_without_panels() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::env::set_var("SHINE_RUNTIME_DIR", tmp.path());

    // Empty but valid config on disk for reload.
    let config_path = tmp.path().join("prisms.json");
    let config = Config::default();
    config.save_to(&config_path).unwrap();

    let state = DaemonStateWriter::create(&tmp.path().join("shined.state")).unwrap();
    let sock = tmp.path().join("shined.sock");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (rpc_tx, mut rpc_rx) = mpsc::unbounded_channel::<RpcIncoming>();
    let _server = RpcServer::start(sock.clone(), rpc_tx).unwrap();

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

    let supervisor = Supervisor::new(
        &config_path,
        config,
        PathBuf::from("/bin/true"),
        state,
        event_tx.clone(),
    );
    let run_handle = tokio::spawn(supervisor.run(event_rx));

    let client = RpcClient::new(&sock);

    // panel/list: empty.
    let result = client.call("panel/list", None).await.unwrap();
    let list: PanelListResult = serde_json::from_value(result).unwrap();
    assert!(list.panels.is_empty());

    // service/status: version and uptime.
    let result = client.call("service/status", None).await.unwrap();
    let status: ServiceStatusResult = serde_json::from_value(result).unwrap();
    assert_eq!(status.version, shine::VERSION);
    assert!(status.panels.is_empty());

    // Unknown method.
    let err = client
        .call("panel/teleport", None)
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("-32601") || err.contains("unknown method"), "got: {err}");

    // panel/kill for a missing instance fails.
    let err = client
        .call(
            "panel/kill",
            Some(serde_json::json!({ "instance": "ghost" })),
        )
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("not found"), "got: {err}");

    // panel/spawn with an invalid descriptor is rejected up front.
    let err = client
        .call(
            "panel/spawn",
            Some(serde_json::json!({
                "config": { "name": "ghost", "path": "/nonexistent/bin" }
            })),
        )
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("not found") || err.contains("invalid"), "got: {err}");

    // config/reload with a valid (still empty) file succeeds.
    let result = client.call("config/reload", None).await.unwrap();
    assert_eq!(result["reloaded"], true);

    // config/reload with a broken file reports the error without dying.
    std::fs::write(&config_path, b"{ broken json").unwrap();
    let result = client.call("config/reload", None).await.unwrap();
    assert_eq!(result["reloaded"], false);

    // Notifications for unknown panels are ignored, not fatal.
    event_tx
        .send(SupervisorEvent::Rpc {
            request: shine::rpc::RpcRequest::notification(
                "prism/crashed",
                Some(serde_json::json!({
                    "panel": "ghost", "name": "ghost", "exitCode": 1, "signal": 0
                })),
            ),
            reply: None,
        })
        .unwrap();

    // Shut down cleanly.
    event_tx.send(SupervisorEvent::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(5), run_handle)
        .await
        .expect("supervisor did not stop")
        .unwrap()
        .unwrap();

    std::env::remove_var("SHINE_RUNTIME_DIR");
}
