//! Supervisor-facing JSON-RPC 2.0 over Unix sockets.
//!
//! The supervisor serves `panel/list`, `panel/spawn`, `panel/kill`,
//! `service/status`, and `config/reload`, and consumes controller
//! notifications: `prism/started`, `prism/stopped`, `prism/crashed`, and
//! `foreground/changed`.

mod client;
mod protocol;
mod server;

pub use client::RpcClient;
pub use protocol::{
    ConfigReloadResult, ForegroundChangedParams, PanelInfo, PanelKillParams, PanelKillResult,
    PanelListResult, PanelSpawnParams, PanelSpawnResult, PrismCrashedParams, PrismStartedParams,
    PrismStoppedParams, RpcError, RpcRequest, RpcResponse, ServiceStatusResult, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, METHOD_NOT_FOUND, PARSE_ERROR,
};
pub use server::{RpcIncoming, RpcServer, READ_DEADLINE};

use serde::Serialize;

/// Best-effort notification sender used by controllers.
///
/// A supervisor is optional: a panel started by hand has nobody listening,
/// so connection failures are logged at debug and dropped. Sends happen on
/// spawned tasks and never block the controller's event loop.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: Option<RpcClient>,
    panel: String,
}

impl Notifier {
    /// A notifier that targets the default supervisor socket.
    #[must_use]
    pub fn new(panel: &str) -> Self {
        let client = crate::paths::shined_socket().ok().map(|p| RpcClient::new(&p));
        Self {
            client,
            panel: panel.to_string(),
        }
    }

    /// A notifier that never sends (tests, standalone panels).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            client: None,
            panel: String::new(),
        }
    }

    fn send<P: Serialize + Send + Sync + 'static>(&self, method: &'static str, params: P) {
        let Some(client) = self.client.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = client.notify(method, &params).await {
                log::debug!("[Rpc] {method} notification dropped: {e:#}");
            }
        });
    }

    pub fn prism_started(&self, name: &str, pid: i32) {
        self.send(
            "prism/started",
            protocol::PrismStartedParams {
                panel: self.panel.clone(),
                name: name.to_string(),
                pid,
            },
        );
    }

    pub fn prism_stopped(&self, name: &str, exit_code: i32) {
        self.send(
            "prism/stopped",
            protocol::PrismStoppedParams {
                panel: self.panel.clone(),
                name: name.to_string(),
                exit_code,
            },
        );
    }

    pub fn prism_crashed(&self, name: &str, exit_code: i32, signal: i32) {
        self.send(
            "prism/crashed",
            protocol::PrismCrashedParams {
                panel: self.panel.clone(),
                name: name.to_string(),
                exit_code,
                signal,
            },
        );
    }

    pub fn foreground_changed(&self, from: &str, to: &str) {
        self.send(
            "foreground/changed",
            protocol::ForegroundChangedParams {
                panel: self.panel.clone(),
                from: from.to_string(),
                to: to.to_string(),
            },
        );
    }
}
