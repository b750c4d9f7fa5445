//! Control endpoint server.
//!
//! Listens on a Unix socket in the supervisor's state directory, reads
//! length-prefixed JSON requests and hands validated commands to a
//! [`ControlDispatch`] implementation.
//!
//! # Thread Safety
//!
//! Each connection is handled in its own spawned task. The dispatcher is
//! shared via `Arc`; the supervisor behind it serializes all mutation on its
//! own event loop.

use super::protocol::{read_frame, write_frame, ControlCommand, ControlRequest, ControlResponse};
use crate::config::IpcConfig;
use crate::error::{DroverError, Result};
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running control server. Dropping shuts down the server.
pub struct ControlServerHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    active_connections: Arc<AtomicUsize>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ControlServerHandle {
    /// Path of the listening socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections and ask idle connections to close.
    ///
    /// Requests that are already being processed still get their response.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Shut down, wait for in-flight requests (bounded by
    /// `IpcConfig::DRAIN_TIMEOUT`) and remove the socket file.
    pub async fn drain(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + IpcConfig::DRAIN_TIMEOUT;
        while self.active_connections.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Control server drain timed out with {} connections open",
                    self.active_connections.load(Ordering::Acquire)
                );
                break;
            }
            tokio::time::sleep(IpcConfig::LAUNCH_POLL_INTERVAL).await;
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Could not remove control socket {}: {}", self.path.display(), e);
        }
        info!("Control server stopped");
    }
}

impl Drop for ControlServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Executes validated control commands.
///
/// Implemented by `SupervisorHandle`.
#[async_trait::async_trait]
pub trait ControlDispatch: Send + Sync + 'static {
    /// Run a command and return the response body.
    async fn dispatch(&self, command: ControlCommand) -> Result<Value>;
}

/// Control endpoint server.
pub struct ControlServer;

impl ControlServer {
    /// Bind the control socket at `path` and start serving.
    ///
    /// A stale socket file left by a dead supervisor is replaced; a socket
    /// that still accepts connections is an error.
    pub async fn start<D: ControlDispatch>(
        path: impl AsRef<Path>,
        dispatch: Arc<D>,
    ) -> Result<ControlServerHandle> {
        let path = path.as_ref().to_path_buf();
        prepare_socket_path(&path).await?;

        let listener =
            UnixListener::bind(&path).map_err(|e| DroverError::io_with_path(e, &path))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| DroverError::io_with_path(e, &path))?;

        info!("Control server listening on {}", path.display());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(ControlServerHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            active_connections,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: ControlDispatch>(
        listener: UnixListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Control accept loop stopping");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let current = active_connections.load(Ordering::Acquire);
                            if current >= IpcConfig::MAX_CONTROL_CONNECTIONS {
                                warn!(
                                    "Rejecting control connection: at max capacity ({})",
                                    IpcConfig::MAX_CONTROL_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::AcqRel);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, &*dispatch, &mut conn_shutdown).await {
                                    debug!("Control connection ended: {}", e);
                                }
                                conns.fetch_sub(1, Ordering::AcqRel);
                            });
                        }
                        Err(e) => {
                            error!("Control accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: ControlDispatch>(
        mut stream: UnixStream,
        dispatch: &D,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let response = Self::process_request(&frame, dispatch).await;
            let response_bytes = serde_json::to_vec(&response)?;
            write_frame(&mut writer, &response_bytes).await?;
        }
    }

    async fn process_request<D: ControlDispatch>(frame: &[u8], dispatch: &D) -> ControlResponse {
        let request: ControlRequest = match serde_json::from_slice(frame) {
            Ok(req) => req,
            Err(e) => {
                return ControlResponse::error(&DroverError::InvalidRequest {
                    message: format!("Parse error: {}", e),
                });
            }
        };

        let command = match ControlCommand::try_from(request) {
            Ok(command) => command,
            Err(e) => return ControlResponse::error(&e),
        };

        debug!("Control command: {:?}", command);
        match dispatch.dispatch(command).await {
            Ok(msg) => ControlResponse::ok(msg),
            Err(e) => {
                if e.status_code() >= 500 {
                    warn!("Control command failed: {}", e);
                }
                ControlResponse::error(&e)
            }
        }
    }
}

async fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DroverError::io_with_path(e, parent))?;
    }

    if !path.exists() {
        return Ok(());
    }

    let probe = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, UnixStream::connect(path)).await;
    if matches!(probe, Ok(Ok(_))) {
        return Err(DroverError::Other(format!(
            "Another supervisor is already listening on {}",
            path.display()
        )));
    }

    debug!("Removing stale control socket {}", path.display());
    std::fs::remove_file(path).map_err(|e| DroverError::io_with_path(e, path))
}
