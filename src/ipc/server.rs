//! Unix domain socket server for panel IPC.
//!
//! Binds a `UnixListener` and spawns an accept loop. Each accepted
//! connection reads one JSON line, forwards it to the controller's event
//! loop through a channel, awaits the reply, writes one JSON line back,
//! and closes. The server never touches controller state itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::protocol::{Request, Response};

/// End-to-end deadline per connection (read and write).
pub const CONNECTION_DEADLINE: Duration = Duration::from_secs(5);

/// A decoded request paired with its reply channel.
pub type IpcRequest = (Request, oneshot::Sender<Response>);

/// Unix socket server for a single panel controller.
#[derive(Debug)]
pub struct IpcServer {
    /// Path to the socket file (for cleanup).
    socket_path: PathBuf,
    /// Handle to the accept loop task.
    accept_handle: JoinHandle<()>,
}

impl IpcServer {
    /// Start the server at the given path.
    ///
    /// Removes any stale socket file, binds the listener, sets permissions
    /// to 0600, and spawns the accept loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the path exceeds the `sun_path` limit or the
    /// socket cannot be bound.
    pub fn start(socket_path: PathBuf, request_tx: UnboundedSender<IpcRequest>) -> Result<Self> {
        // sun_path is 104 bytes on macOS, 108 on Linux; use the conservative limit.
        const MAX_SOCKET_PATH: usize = 104;
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "Socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        // Remove stale socket file if it exists.
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

        // Owner-only permissions.
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("[Ipc] Listening on {}", socket_path.display());

        let path_clone = socket_path.clone();
        let accept_handle = tokio::spawn(Self::accept_loop(listener, request_tx, path_clone));

        Ok(Self {
            socket_path,
            accept_handle,
        })
    }

    /// Accept loop — runs as a tokio task.
    async fn accept_loop(
        listener: UnixListener,
        request_tx: UnboundedSender<IpcRequest>,
        socket_path: PathBuf,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let tx = request_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, tx).await {
                            log::debug!("[Ipc] Connection closed: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    // Socket file gone means we're shutting down.
                    if !socket_path.exists() {
                        log::info!("[Ipc] Socket removed, stopping accept loop");
                        break;
                    }
                    log::error!("[Ipc] Accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One request, one response, close.
    ///
    /// Protocol and parse errors just close the connection; the controller
    /// keeps running.
    async fn handle_connection(
        stream: UnixStream,
        request_tx: UnboundedSender<IpcRequest>,
    ) -> Result<()> {
        timeout(CONNECTION_DEADLINE, async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read_half)
                .read_line(&mut line)
                .await
                .context("read failed")?;

            let request: Request =
                serde_json::from_str(line.trim_end()).context("malformed request")?;

            let (reply_tx, reply_rx) = oneshot::channel();
            request_tx
                .send((request, reply_tx))
                .map_err(|_| anyhow::anyhow!("controller event loop gone"))?;
            let response = reply_rx
                .await
                .context("controller dropped the request")?;

            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            write_half.write_all(&encoded).await.context("write failed")?;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("connection deadline exceeded")?
    }

    /// Stop accepting and remove the socket file.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            log::debug!(
                "[Ipc] Failed to remove socket {}: {e}",
                self.socket_path.display()
            );
        }
    }

    /// Path to the socket file.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
