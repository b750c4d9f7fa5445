//! Control endpoint client.
//!
//! One request per connection. When the endpoint is missing or refuses the
//! connection, [`ControlClient::send_or_launch`] starts a detached
//! supervisor, waits for the socket to come up and retries once.

use super::protocol::{read_frame, write_frame, ControlCommand, ControlRequest, ControlResponse};
use crate::config::{IpcConfig, StatePaths};
use crate::error::{DroverError, Result};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio::net::UnixStream;
use tracing::{debug, info};

/// Client for the supervisor's control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<UnixStream> {
        let unavailable = || DroverError::SupervisorUnavailable {
            path: self.path.clone(),
        };
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, UnixStream::connect(&self.path))
            .await
            .map_err(|_| unavailable())?
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::ConnectionRefused => unavailable(),
                _ => DroverError::io_with_path(e, &self.path),
            })?;
        Ok(stream)
    }

    /// Send one command and wait for its response.
    ///
    /// Non-200 responses are returned as values, not errors.
    pub async fn send(&self, command: &ControlCommand) -> Result<ControlResponse> {
        let mut stream = self.connect().await?;
        let (mut reader, mut writer) = stream.split();

        let request = ControlRequest::from(command);
        let request_bytes = serde_json::to_vec(&request)?;
        write_frame(&mut writer, &request_bytes).await?;

        let response_bytes =
            tokio::time::timeout(IpcConfig::SERVER_REPLY_TIMEOUT, read_frame(&mut reader))
                .await
                .map_err(|_| DroverError::Timeout(IpcConfig::SERVER_REPLY_TIMEOUT))??
                .ok_or_else(|| DroverError::ipc("Supervisor closed the connection without replying"))?;

        let response: ControlResponse =
            serde_json::from_slice(&response_bytes).map_err(|e| DroverError::Json {
                message: format!("Failed to parse control response: {}", e),
                source: Some(e),
            })?;
        Ok(response)
    }

    /// Like [`send`](Self::send), but launches the supervisor first if it is
    /// not reachable.
    pub async fn send_or_launch(
        &self,
        command: &ControlCommand,
        launch: &LaunchSpec,
    ) -> Result<ControlResponse> {
        match self.send(command).await {
            Err(e) if e.is_unreachable() => {
                info!("Supervisor not reachable at {}, launching", self.path.display());
                launch.launch()?;
                self.wait_ready(IpcConfig::LAUNCH_TIMEOUT).await?;
                self.send(command).await
            }
            other => other,
        }
    }

    /// Poll until the control socket accepts connections.
    pub async fn wait_ready(&self, timeout: std::time::Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.connect().await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_unreachable() => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(e);
                    }
                    tokio::time::sleep(IpcConfig::LAUNCH_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// How to start a detached supervisor.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    program: PathBuf,
    args: Vec<OsString>,
    log_file: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_file: None,
        }
    }

    /// `<current exe> --home <root> daemon`, logging to `supervisor.log`.
    pub fn daemon(paths: &StatePaths) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe)
            .with_arg("--home")
            .with_arg(paths.root())
            .with_arg("daemon")
            .with_log_file(paths.log_file()))
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Spawn the supervisor in its own session and return its pid.
    ///
    /// The child is not waited on.
    pub fn launch(&self) -> Result<u32> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());

        if let Some(ref log_file) = self.log_file {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent).map_err(|e| DroverError::io_with_path(e, parent))?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .map_err(|e| DroverError::io_with_path(e, log_file))?;
            let stdout_file = file
                .try_clone()
                .map_err(|e| DroverError::io_with_path(e, log_file))?;
            cmd.stdout(Stdio::from(stdout_file));
            cmd.stderr(Stdio::from(file));
        } else {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        detach(&mut cmd);

        let child = cmd.spawn().map_err(|e| DroverError::io_with_path(e, &self.program))?;
        let pid = child.id();
        debug!("Launched supervisor {} with PID {}", self.program.display(), pid);
        Ok(pid)
    }
}

#[allow(unsafe_code)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid() is async-signal-safe; the closure allocates nothing
    // and touches no locks, so it is sound to run between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::{ControlDispatch, ControlServer};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct TestDispatch;

    #[async_trait::async_trait]
    impl ControlDispatch for TestDispatch {
        async fn dispatch(&self, command: ControlCommand) -> Result<Value> {
            match command {
                ControlCommand::Alive => Ok(json!({"pid": std::process::id()})),
                ControlCommand::Start(dir) => Err(DroverError::AlreadyRunning { dir }),
                _ => Ok(Value::Null),
            }
        }
    }

    #[tokio::test]
    async fn test_client_send_success() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drover.sock");
        let handle = ControlServer::start(&path, Arc::new(TestDispatch)).await.unwrap();

        let client = ControlClient::new(&path);
        let response = client.send(&ControlCommand::Alive).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(response.msg["pid"], json!(std::process::id()));

        handle.drain().await;
    }

    #[tokio::test]
    async fn test_client_returns_error_responses_as_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drover.sock");
        let handle = ControlServer::start(&path, Arc::new(TestDispatch)).await.unwrap();

        let client = ControlClient::new(&path);
        let response = client
            .send(&ControlCommand::Start(PathBuf::from("/srv/app")))
            .await
            .unwrap();
        assert_eq!(response.code, 409);

        handle.drain().await;
    }

    #[tokio::test]
    async fn test_missing_socket_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let client = ControlClient::new(dir.path().join("missing.sock"));
        let err = client.send(&ControlCommand::Alive).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_stale_socket_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        {
            let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        }
        let client = ControlClient::new(&path);
        let err = client.send(&ControlCommand::Alive).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let dir = TempDir::new().unwrap();
        let client = ControlClient::new(dir.path().join("missing.sock"));
        let result = client.wait_ready(std::time::Duration::from_millis(120)).await;
        assert!(result.unwrap_err().is_unreachable());
    }

    #[test]
    fn test_daemon_launch_spec() {
        let paths = StatePaths::new("/tmp/drover-home");
        let spec = LaunchSpec::daemon(&paths).unwrap();
        assert_eq!(
            spec.args,
            vec![
                OsString::from("--home"),
                OsString::from("/tmp/drover-home"),
                OsString::from("daemon")
            ]
        );
        assert_eq!(spec.log_file, Some(paths.log_file()));
    }
}
