//! Centralized configuration for drover.
//!
//! Timing windows, file names and environment variable names used by the
//! supervisor, the scheduler, the channel bus and the IPC layer.

use crate::error::{DroverError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervisor lifecycle configuration.
pub struct SupervisorConfig;

impl SupervisorConfig {
    /// Exits closer than this to the previous spawn count as fast respawns.
    pub const FAST_RESPAWN_WINDOW: Duration = Duration::from_millis(3000);
    /// The n-th consecutive fast respawn trips the circuit breaker.
    pub const FAST_RESPAWN_LIMIT: u32 = 3;
    /// How long a circuit-broken slot stays disabled.
    pub const RESPAWN_COOLDOWN: Duration = Duration::from_millis(10_000);

    pub const HOME_ENV: &'static str = "DROVER_HOME";
    pub const STATE_DIR_NAME: &'static str = ".drover";
    pub const SOCKET_FILE_NAME: &'static str = "drover.sock";
    pub const PROGRAMS_FILE_NAME: &'static str = "programs.json";
    pub const LOG_FILE_NAME: &'static str = "supervisor.log";
    pub const PID_FILE_NAME: &'static str = "drover.pid";
    pub const MANIFEST_FILE_NAME: &'static str = "drover.json";
}

/// Socket scheduler configuration.
pub struct SchedulerConfig;

impl SchedulerConfig {
    pub const POLICY_ENV: &'static str = "DROVER_SCHED_POLICY";
    /// A connection declined this many times is closed instead of re-queued.
    pub const MAX_HANDOFF_ATTEMPTS: u32 = 8;
}

/// Channel bus configuration.
pub struct ChannelConfig;

impl ChannelConfig {
    /// How long an aggregated query waits for sibling answers.
    pub const QUERY_TIMEOUT: Duration = Duration::from_millis(400);
    /// Extra time a worker waits for the supervisor's aggregate.
    pub const WORKER_QUERY_GRACE: Duration = Duration::from_millis(150);
}

/// IPC transport and control endpoint configuration.
pub struct IpcConfig;

impl IpcConfig {
    /// Largest control frame accepted on the control socket.
    pub const MAX_CONTROL_MESSAGE_SIZE: usize = 1024 * 1024;
    /// Largest supervisor/worker packet.
    pub const MAX_PACKET_SIZE: usize = 64 * 1024;
    /// Concurrent control connections before new ones are turned away.
    pub const MAX_CONTROL_CONNECTIONS: usize = 64;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(5);
    pub const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(50);
    pub const SERVER_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

    pub const CHANNEL_FD_ENV: &'static str = "DROVER_CHANNEL_FD";
    pub const WORKER_ID_ENV: &'static str = "DROVER_WORKER_ID";
    pub const WORKER_SLOT_ENV: &'static str = "DROVER_WORKER_SLOT";
    pub const PROGRAM_DIR_ENV: &'static str = "DROVER_PROGRAM_DIR";
}

/// How a stream listening endpoint is shared across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// The supervisor accepts and hands each connection to one worker.
    #[default]
    RoundRobin,
    /// Every worker receives a duplicate of the listening handle.
    Shared,
}

impl SchedulingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingPolicy::RoundRobin => "rr",
            SchedulingPolicy::Shared => "shared",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rr" | "round-robin" | "roundrobin" => Some(SchedulingPolicy::RoundRobin),
            "shared" | "none" => Some(SchedulingPolicy::Shared),
            _ => None,
        }
    }

    /// Read the policy from `DROVER_SCHED_POLICY`, defaulting to round-robin.
    pub fn from_env() -> Self {
        std::env::var(SchedulerConfig::POLICY_ENV)
            .ok()
            .and_then(|v| Self::from_str(&v))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Files inside the supervisor's private state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `$DROVER_HOME`, or `~/.drover`.
    pub fn default_location() -> Result<Self> {
        if let Some(home) = std::env::var_os(SupervisorConfig::HOME_ENV) {
            return Ok(Self::new(PathBuf::from(home)));
        }
        let home = dirs::home_dir().ok_or_else(|| DroverError::Other(
            "Could not determine home directory".to_string(),
        ))?;
        Ok(Self::new(home.join(SupervisorConfig::STATE_DIR_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join(SupervisorConfig::SOCKET_FILE_NAME)
    }

    pub fn programs(&self) -> PathBuf {
        self.root.join(SupervisorConfig::PROGRAMS_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(SupervisorConfig::LOG_FILE_NAME)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(SupervisorConfig::PID_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_roundtrip() {
        for policy in [SchedulingPolicy::RoundRobin, SchedulingPolicy::Shared] {
            assert_eq!(SchedulingPolicy::from_str(policy.as_str()), Some(policy));
        }
        assert_eq!(SchedulingPolicy::from_str("bogus"), None);
        assert_eq!(SchedulingPolicy::default(), SchedulingPolicy::RoundRobin);
    }

    #[test]
    fn test_state_paths() {
        let paths = StatePaths::new("/tmp/drover-test");
        assert!(paths.socket().ends_with("drover.sock"));
        assert!(paths.programs().ends_with("programs.json"));
        assert_eq!(paths.root(), Path::new("/tmp/drover-test"));
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(SupervisorConfig::RESPAWN_COOLDOWN > SupervisorConfig::FAST_RESPAWN_WINDOW);
        assert!(ChannelConfig::QUERY_TIMEOUT < IpcConfig::SERVER_REPLY_TIMEOUT);
    }
}
