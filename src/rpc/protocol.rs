//! JSON-RPC 2.0 frames and the supervisor's method payloads.
//!
//! The wire is newline-terminated JSON over a Unix socket. Requests with
//! an `id` expect a response; requests without one are notifications.

use serde::{Deserialize, Serialize};

use crate::config::PrismConfig;

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// A request or notification frame.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RpcRequest {
    #[must_use]
    pub fn call(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(serde_json::json!(id)),
            method: method.to_string(),
            params,
        }
    }

    #[must_use]
    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A response frame.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Error member of a failed response.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    #[must_use]
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: serde_json::Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Method payloads
// ---------------------------------------------------------------------------

/// One panel in `panel/list` and `service/status` results.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PanelInfo {
    pub instance: String,
    pub name: String,
    pub pid: i32,
    pub socket: String,
    pub healthy: bool,
}

/// `panel/list` result.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PanelListResult {
    pub panels: Vec<PanelInfo>,
}

/// `panel/spawn` params.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PanelSpawnParams {
    pub config: PrismConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// `panel/spawn` result.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PanelSpawnResult {
    pub instance: String,
    pub socket: String,
}

/// `panel/kill` params.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PanelKillParams {
    pub instance: String,
}

/// `panel/kill` result.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PanelKillResult {
    pub killed: bool,
}

/// `service/status` result.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServiceStatusResult {
    pub panels: Vec<PanelInfo>,
    pub uptime_ms: i64,
    pub version: String,
}

/// `config/reload` result.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfigReloadResult {
    pub reloaded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Controller → supervisor notifications
// ---------------------------------------------------------------------------

/// `prism/started` params.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrismStartedParams {
    pub panel: String,
    pub name: String,
    pub pid: i32,
}

/// `prism/stopped` params (clean exit, code 0).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrismStoppedParams {
    pub panel: String,
    pub name: String,
    pub exit_code: i32,
}

/// `prism/crashed` params (non-zero exit or signal).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrismCrashedParams {
    pub panel: String,
    pub name: String,
    pub exit_code: i32,
    pub signal: i32,
}

/// `foreground/changed` params.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ForegroundChangedParams {
    pub panel: String,
    pub from: String,
    pub to: String,
}
