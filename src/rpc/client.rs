//! JSON-RPC client: calls for tooling, fire-and-forget notifications for
//! controllers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use super::protocol::{RpcRequest, RpcResponse};

const CALL_DEADLINE: Duration = Duration::from_secs(5);

/// One-connection-per-operation JSON-RPC client.
#[derive(Debug, Clone)]
pub struct RpcClient {
    socket_path: PathBuf,
}

impl RpcClient {
    #[must_use]
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
        }
    }

    /// Issue a call and return its `result` member.
    ///
    /// # Errors
    ///
    /// Fails on connect/deadline problems or when the server returns an
    /// `error` member.
    pub async fn call(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        timeout(CALL_DEADLINE, self.call_inner(method, params))
            .await
            .map_err(|_| anyhow!("rpc call {method} timed out"))?
    }

    async fn call_inner(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!("Failed to connect to supervisor: {}", self.socket_path.display())
            })?;
        let (read_half, mut write_half) = stream.into_split();

        let mut encoded = serde_json::to_vec(&RpcRequest::call(1, method, params))?;
        encoded.push(b'\n');
        write_half.write_all(&encoded).await?;

        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await?;
        if line.is_empty() {
            anyhow::bail!("supervisor closed the connection");
        }

        let response: RpcResponse =
            serde_json::from_str(line.trim_end()).context("Malformed rpc response")?;
        if let Some(error) = response.error {
            anyhow::bail!("{method} failed: {} (code {})", error.message, error.code);
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    /// Send a notification; no response is read.
    pub async fn notify<P: Serialize>(&self, method: &str, params: &P) -> Result<()> {
        let params = serde_json::to_value(params)?;
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!("Failed to connect to supervisor: {}", self.socket_path.display())
            })?;

        let mut encoded =
            serde_json::to_vec(&RpcRequest::notification(method, Some(params)))?;
        encoded.push(b'\n');
        stream.write_all(&encoded).await?;
        Ok(())
    }
}
