//! Control endpoint protocol types and framing.
//!
//! Defines the wire format for the control socket: 4-byte big-endian length
//! prefix followed by a UTF-8 JSON payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests are `{"action": ..., "data": ...}`, responses are
//! `{"code": ..., "msg": ...}`.

use crate::config::IpcConfig;
use crate::error::{DroverError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Control actions accepted by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    Reload,
    Status,
    Alive,
    Exit,
}

/// Raw control request as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlRequest {
    pub fn new(action: ControlAction, data: Option<Value>) -> Self {
        Self { action, data }
    }
}

impl From<&ControlCommand> for ControlRequest {
    fn from(command: &ControlCommand) -> Self {
        let dir = |d: &PathBuf| Some(Value::String(d.to_string_lossy().into_owned()));
        match command {
            ControlCommand::Start(d) => Self::new(ControlAction::Start, dir(d)),
            ControlCommand::Stop(d) => Self::new(ControlAction::Stop, dir(d)),
            ControlCommand::Restart(d) => Self::new(ControlAction::Restart, dir(d)),
            ControlCommand::Reload(d) => Self::new(ControlAction::Reload, dir(d)),
            ControlCommand::Status(dirs) if dirs.is_empty() => {
                Self::new(ControlAction::Status, None)
            }
            ControlCommand::Status(dirs) => Self::new(
                ControlAction::Status,
                Some(Value::Array(
                    dirs.iter()
                        .map(|d| Value::String(d.to_string_lossy().into_owned()))
                        .collect(),
                )),
            ),
            ControlCommand::Alive => Self::new(ControlAction::Alive, None),
            ControlCommand::Exit => Self::new(ControlAction::Exit, None),
        }
    }
}

/// A validated control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start(PathBuf),
    Stop(PathBuf),
    Restart(PathBuf),
    Reload(PathBuf),
    /// Empty means every program.
    Status(Vec<PathBuf>),
    Alive,
    Exit,
}

impl TryFrom<ControlRequest> for ControlCommand {
    type Error = DroverError;

    fn try_from(request: ControlRequest) -> Result<Self> {
        let command = match request.action {
            ControlAction::Start => ControlCommand::Start(single_dir(request.data)?),
            ControlAction::Stop => ControlCommand::Stop(single_dir(request.data)?),
            ControlAction::Restart => ControlCommand::Restart(single_dir(request.data)?),
            ControlAction::Reload => ControlCommand::Reload(single_dir(request.data)?),
            ControlAction::Status => ControlCommand::Status(dir_list(request.data)?),
            ControlAction::Alive => ControlCommand::Alive,
            ControlAction::Exit => ControlCommand::Exit,
        };
        Ok(command)
    }
}

fn parse_dir(value: &Value) -> Result<PathBuf> {
    let dir = value.as_str().ok_or_else(|| DroverError::InvalidRequest {
        message: format!("Expected a directory string, got {}", value),
    })?;
    if dir.is_empty() {
        return Err(DroverError::InvalidRequest {
            message: "Directory must not be empty".to_string(),
        });
    }
    let path = PathBuf::from(dir);
    if !path.is_absolute() {
        return Err(DroverError::InvalidRequest {
            message: format!("Directory must be absolute: {}", dir),
        });
    }
    Ok(path)
}

fn single_dir(data: Option<Value>) -> Result<PathBuf> {
    match data {
        Some(value) => parse_dir(&value),
        None => Err(DroverError::InvalidRequest {
            message: "Missing directory".to_string(),
        }),
    }
}

fn dir_list(data: Option<Value>) -> Result<Vec<PathBuf>> {
    match data {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(parse_dir).collect(),
        Some(value) => Ok(vec![parse_dir(&value)?]),
    }
}

/// Control response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub code: u16,
    pub msg: Value,
}

impl ControlResponse {
    pub const OK: u16 = 200;

    pub fn ok(msg: Value) -> Self {
        Self {
            code: Self::OK,
            msg,
        }
    }

    pub fn error(err: &DroverError) -> Self {
        Self {
            code: err.status_code(),
            msg: Value::String(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_CONTROL_MESSAGE_SIZE {
        return Err(DroverError::InvalidRequest {
            message: format!(
                "Control message size {} exceeds maximum {}",
                len,
                IpcConfig::MAX_CONTROL_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| DroverError::InvalidRequest {
        message: format!("Frame of {} bytes is too large", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
