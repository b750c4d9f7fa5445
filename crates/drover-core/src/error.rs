//! Error types for drover.
//!
//! Control-plane errors (`AlreadyRunning`, `NotRunning`) are surfaced verbatim
//! to the client; scheduler bind failures are surfaced to the requesting
//! worker. Everything else maps to a generic failure at the control boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for drover.
#[derive(Debug, Error)]
pub enum DroverError {
    // Control plane
    #[error("Program already running: {dir}")]
    AlreadyRunning { dir: PathBuf },

    #[error("Program not running: {dir}")]
    NotRunning { dir: PathBuf },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // Scheduler
    #[error("Bind failed for {key} (errno {errno}): {message}")]
    Bind {
        key: String,
        errno: i32,
        message: String,
    },

    // Process lifecycle
    #[error("Failed to spawn worker for {dir}: {message}")]
    SpawnFailed { dir: PathBuf, message: String },

    #[error("Invalid manifest for {dir}: {message}")]
    Manifest { dir: PathBuf, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Transport
    #[error("IPC error: {message}")]
    Ipc { message: String },

    #[error("Supervisor not reachable at {path}")]
    SupervisorUnavailable { path: PathBuf },

    #[error("Supervisor event loop has stopped")]
    SupervisorGone,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for drover operations.
pub type Result<T> = std::result::Result<T, DroverError>;

impl From<std::io::Error> for DroverError {
    fn from(err: std::io::Error) -> Self {
        DroverError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for DroverError {
    fn from(err: serde_json::Error) -> Self {
        DroverError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for DroverError {
    fn from(err: nix::errno::Errno) -> Self {
        DroverError::from(std::io::Error::from(err))
    }
}

impl DroverError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DroverError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a transport error.
    pub fn ipc(message: impl Into<String>) -> Self {
        DroverError::Ipc {
            message: message.into(),
        }
    }

    /// Convert to a control-endpoint status code.
    ///
    /// - 400: malformed or unsupported request
    /// - 404: program not running
    /// - 409: program already running
    /// - 500: any other failure
    pub fn status_code(&self) -> u16 {
        match self {
            DroverError::InvalidRequest { .. } => 400,
            DroverError::NotRunning { .. } => 404,
            DroverError::AlreadyRunning { .. } => 409,
            _ => 500,
        }
    }

    /// The OS errno behind this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            DroverError::Bind { errno, .. } => Some(*errno),
            DroverError::Io {
                source: Some(source),
                ..
            } => source.raw_os_error(),
            _ => None,
        }
    }

    /// True when the control endpoint is absent and the client should
    /// launch a supervisor before retrying.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DroverError::SupervisorUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DroverError::NotRunning {
            dir: PathBuf::from("/srv/app"),
        };
        assert_eq!(err.to_string(), "Program not running: /srv/app");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DroverError::AlreadyRunning {
                dir: PathBuf::from("/a")
            }
            .status_code(),
            409
        );
        assert_eq!(
            DroverError::NotRunning {
                dir: PathBuf::from("/a")
            }
            .status_code(),
            404
        );
        assert_eq!(
            DroverError::InvalidRequest {
                message: "bad".into()
            }
            .status_code(),
            400
        );
        assert_eq!(DroverError::Other("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_errno_from_io() {
        let err = DroverError::from(std::io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert_eq!(err.errno(), Some(libc::EADDRINUSE));
        assert!(DroverError::SupervisorGone.errno().is_none());
    }
}
