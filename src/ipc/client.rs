//! Client for talking to a panel controller's IPC socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use super::protocol::{Action, Request, Response, StatusData};
use super::server::CONNECTION_DEADLINE;

/// One-shot request/response client. Cheap to construct; every call opens
/// a fresh connection, matching the one-request-per-connection contract.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
    deadline: Duration,
}

impl IpcClient {
    #[must_use]
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            deadline: CONNECTION_DEADLINE,
        }
    }

    /// Send a request and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns an error on connect failure, deadline expiry, or a
    /// malformed response. A well-formed `success: false` response is
    /// returned as `Ok` — the caller decides how to surface it.
    pub async fn send(&self, request: &Request) -> Result<Response> {
        timeout(self.deadline, self.send_inner(request))
            .await
            .map_err(|_| {
                anyhow!(
                    "request to {} timed out after {:?}",
                    self.socket_path.display(),
                    self.deadline
                )
            })?
    }

    async fn send_inner(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!("Failed to connect to socket: {}", self.socket_path.display())
            })?;
        let (read_half, mut write_half) = stream.into_split();

        let mut encoded = serde_json::to_vec(request)?;
        encoded.push(b'\n');
        write_half
            .write_all(&encoded)
            .await
            .context("Failed to send request")?;

        let mut line = String::new();
        BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .context("Failed to read response")?;
        if line.is_empty() {
            anyhow::bail!("connection closed without a response");
        }

        let response: Response =
            serde_json::from_str(line.trim_end()).context("Malformed response")?;
        Ok(response)
    }

    /// Send a request and fail on an unsuccessful response.
    async fn send_expect_success(&self, request: &Request) -> Result<Response> {
        let response = self.send(request).await?;
        if !response.success {
            anyhow::bail!("{:?} failed: {}", request.action, response.message);
        }
        Ok(response)
    }

    /// Launch or foreground a prism.
    pub async fn start(&self, prism: &str) -> Result<()> {
        self.send_expect_success(&Request::with_prism(Action::Start, prism))
            .await?;
        Ok(())
    }

    /// Terminate a prism.
    pub async fn kill(&self, prism: &str) -> Result<()> {
        self.send_expect_success(&Request::with_prism(Action::Kill, prism))
            .await?;
        Ok(())
    }

    /// Fetch the controller status snapshot.
    pub async fn status(&self) -> Result<StatusData> {
        let response = self.send_expect_success(&Request::new(Action::Status)).await?;
        let data = response.data.context("status response carried no data")?;
        let status: StatusData =
            serde_json::from_value(data).context("Failed to parse status data")?;
        Ok(status)
    }

    /// Fetch prism names in MRU order.
    pub async fn list(&self) -> Result<Vec<String>> {
        let response = self.send_expect_success(&Request::new(Action::List)).await?;
        let data = response.data.unwrap_or_else(|| serde_json::json!([]));
        let names: Vec<String> =
            serde_json::from_value(data).context("Failed to parse list data")?;
        Ok(names)
    }

    /// Request graceful controller shutdown.
    pub async fn stop(&self) -> Result<()> {
        self.send_expect_success(&Request::new(Action::Stop)).await?;
        Ok(())
    }

    /// Liveness probe: a controller that answers `status` is healthy.
    pub async fn ping(&self) -> Result<()> {
        self.status().await.map(|_| ())
    }
}
