//! Worker process signalling.

use crate::error::{DroverError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// Uses `kill(pid, 0)`, which checks for existence without delivering a
/// signal. Unreaped zombies still count as alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Deliver `signal` to `pid`.
///
/// Returns `Ok(false)` if the process no longer exists.
pub fn signal_process(pid: u32, signal: Signal) -> Result<bool> {
    let raw = i32::try_from(pid)
        .map_err(|_| DroverError::Other(format!("Invalid pid {}", pid)))?;

    debug!("Sending {} to process {}", signal, pid);
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => {
            warn!("Failed to send {} to {}: {}", signal, pid, e);
            Err(e.into())
        }
    }
}

/// Ask a worker to terminate (SIGTERM).
///
/// This only requests termination; the caller observes the actual exit
/// through the child's wait handle.
pub fn terminate_process(pid: u32) -> Result<bool> {
    signal_process(pid, Signal::SIGTERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(4_000_000_000));
    }

    #[test]
    fn test_signal_nonexistent_is_not_an_error() {
        // pid_max on Linux is at most 2^22, so this pid cannot exist
        let result = signal_process(4_194_305, Signal::SIGTERM);
        assert!(matches!(result, Ok(false)));
    }

    #[test]
    fn test_terminate_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");

        assert!(terminate_process(child.id()).unwrap());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
