//! Launching worker processes.

use crate::config::IpcConfig;
use crate::error::{DroverError, Result};
use crate::ipc::transport::IpcChannel;
use crate::manifest::ProgramManifest;
use crate::platform::fd::set_inheritable;
use crate::WorkerId;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// A freshly started worker and the supervisor's end of its channel.
#[derive(Debug)]
pub(crate) struct SpawnedWorker {
    pub pid: u32,
    pub child: Child,
    pub channel: IpcChannel,
}

/// Where a worker's stdio goes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StdioTargets<'a> {
    pub stdout: Option<&'a Path>,
    pub stderr: Option<&'a Path>,
}

/// Fork and exec one worker for `dir`.
///
/// The child end of the channel is inherited only by this child: it is
/// made inheritable just for the spawn and closed in the supervisor right
/// after.
pub(crate) fn spawn_worker(
    dir: &Path,
    manifest: &ProgramManifest,
    worker: WorkerId,
    slot: usize,
    stdio: StdioTargets<'_>,
) -> Result<SpawnedWorker> {
    let spawn_failed = |message: String| DroverError::SpawnFailed {
        dir: dir.to_path_buf(),
        message,
    };

    let (channel, remote) = IpcChannel::pair()?;
    set_inheritable(&remote, true)?;

    let mut cmd = Command::new(&manifest.command);
    cmd.args(&manifest.args)
        .current_dir(dir)
        .envs(&manifest.env)
        .env(IpcConfig::CHANNEL_FD_ENV, remote.as_raw_fd().to_string())
        .env(IpcConfig::WORKER_ID_ENV, worker.to_string())
        .env(IpcConfig::WORKER_SLOT_ENV, slot.to_string())
        .env(IpcConfig::PROGRAM_DIR_ENV, dir)
        .stdin(Stdio::null())
        .stdout(log_target(stdio.stdout)?)
        .stderr(log_target(stdio.stderr)?);

    let child = cmd
        .spawn()
        .map_err(|e| spawn_failed(format!("{}: {}", manifest.command.display(), e)))?;
    drop(remote);

    let pid = child
        .id()
        .ok_or_else(|| spawn_failed("worker exited before it could be tracked".to_string()))?;
    debug!(
        "Spawned worker {} (slot {}) for {} as PID {}",
        worker,
        slot,
        dir.display(),
        pid
    );

    Ok(SpawnedWorker {
        pid,
        child,
        channel,
    })
}

fn log_target(path: Option<&Path>) -> Result<Stdio> {
    let Some(path) = path else {
        return Ok(Stdio::inherit());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DroverError::io_with_path(e, parent))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DroverError::io_with_path(e, path))?;
    Ok(Stdio::from(file))
}
