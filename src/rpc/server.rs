//! JSON-RPC server for the supervisor's aggregation socket.
//!
//! Connections are line-oriented and may carry several frames (controllers
//! reuse a connection for a burst of notifications; `shine` sends one call
//! and hangs up). Calls are forwarded to the supervisor loop with a reply
//! channel; notifications are forwarded without one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::protocol::{RpcRequest, RpcResponse, PARSE_ERROR};

/// Idle read deadline per connection.
pub const READ_DEADLINE: Duration = Duration::from_secs(5);

/// A decoded frame paired with a reply channel; `None` for notifications.
pub type RpcIncoming = (RpcRequest, Option<oneshot::Sender<RpcResponse>>);

/// Unix socket JSON-RPC server.
#[derive(Debug)]
pub struct RpcServer {
    socket_path: PathBuf,
    accept_handle: JoinHandle<()>,
}

impl RpcServer {
    /// Bind and start accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn start(socket_path: PathBuf, incoming_tx: UnboundedSender<RpcIncoming>) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("Failed to remove stale socket: {}", socket_path.display())
            })?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("[Rpc] Listening on {}", socket_path.display());

        let path_clone = socket_path.clone();
        let accept_handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let tx = incoming_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, tx).await {
                                log::debug!("[Rpc] Connection closed: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        if !path_clone.exists() {
                            break;
                        }
                        log::error!("[Rpc] Accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self {
            socket_path,
            accept_handle,
        })
    }

    async fn handle_connection(
        stream: UnixStream,
        incoming_tx: UnboundedSender<RpcIncoming>,
    ) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            let n = match timeout(READ_DEADLINE, reader.read_line(&mut line)).await {
                Ok(result) => result.context("read failed")?,
                Err(_) => return Ok(()), // idle deadline, hang up
            };
            if n == 0 {
                return Ok(()); // EOF
            }

            let request: RpcRequest = match serde_json::from_str(line.trim_end()) {
                Ok(req) => req,
                Err(e) => {
                    let resp = RpcResponse::failure(
                        serde_json::Value::Null,
                        PARSE_ERROR,
                        format!("parse error: {e}"),
                    );
                    Self::write_frame(&mut write_half, &resp).await?;
                    return Ok(());
                }
            };

            if request.is_notification() {
                if incoming_tx.send((request, None)).is_err() {
                    return Ok(());
                }
                continue;
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            if incoming_tx.send((request, Some(reply_tx))).is_err() {
                return Ok(());
            }
            let response = match timeout(READ_DEADLINE, reply_rx).await {
                Ok(Ok(resp)) => resp,
                _ => return Ok(()), // supervisor gone or too slow
            };
            Self::write_frame(&mut write_half, &response).await?;
        }
    }

    async fn write_frame(
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        response: &RpcResponse,
    ) -> Result<()> {
        let mut encoded = serde_json::to_vec(response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await.context("write failed")?;
        Ok(())
    }

    /// Stop accepting and remove the socket file.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }

    /// Path to the socket file.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn spawn_stub_supervisor(mut rx: mpsc::UnboundedReceiver<RpcIncoming>) {
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                if let Some(reply) = reply {
                    let _ = reply.send(RpcResponse::success(
                        request.id.unwrap_or(serde_json::Value::Null),
                        serde_json::json!({ "method": request.method }),
                    ));
                }
            }
        });
    }

    #[tokio::test]
    async fn test_call_gets_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("rpc.sock");
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_stub_supervisor(rx);

        let _server = RpcServer::start(sock.clone(), tx).unwrap();

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let frame = serde_json::to_vec(&RpcRequest::call(1, "panel/list", None)).unwrap();
        stream.write_all(&frame).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let (read_half, _w) = stream.into_split();
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        let response: RpcResponse = serde_json::from_str(line.trim_end()).unwrap();
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["method"], "panel/list");
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("rpc.sock");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _server = RpcServer::start(sock.clone(), tx).unwrap();

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let frame =
            serde_json::to_vec(&RpcRequest::notification("prism/started", None)).unwrap();
        stream.write_all(&frame).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let (request, reply) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.method, "prism/started");
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_parse_error_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("rpc.sock");
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_stub_supervisor(rx);

        let _server = RpcServer::start(sock.clone(), tx).unwrap();

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        stream.write_all(b"{ not json\n").await.unwrap();

        let (read_half, _w) = stream.into_split();
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        let response: RpcResponse = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    }
}
