//! Persisted program table.
//!
//! The supervisor rewrites `programs.json` in full after every start and
//! stop, and replays it once at boot. Writes are atomic:
//! 1. Serialize to a temp file next to the target
//! 2. fsync
//! 3. Rename over the target

use crate::error::{DroverError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One entry of the persisted program table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedProgram {
    pub dir: PathBuf,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

/// Reads and writes the persisted program table.
#[derive(Debug, Clone)]
pub struct ProgramStore {
    path: PathBuf,
}

impl ProgramStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the table. `Ok(None)` when no file exists.
    pub fn read(&self) -> Result<Option<Vec<PersistedProgram>>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DroverError::io_with_path(e, &self.path)),
        };

        let programs = serde_json::from_str(&contents).map_err(|e| DroverError::Json {
            message: format!("Failed to parse {}: {}", self.path.display(), e),
            source: Some(e),
        })?;
        Ok(Some(programs))
    }

    /// Read the table for replay. Unreadable or corrupt files count as
    /// "no prior state".
    pub fn load(&self) -> Vec<PersistedProgram> {
        match self.read() {
            Ok(Some(programs)) => programs,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Ignoring persisted program table: {}", e);
                Vec::new()
            }
        }
    }

    /// Atomically replace the table.
    pub fn save(&self, programs: &[PersistedProgram]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| DroverError::io_with_path(e, parent))?;
        }

        let temp_path = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        let serialized = serde_json::to_string_pretty(programs)?;

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| DroverError::io_with_path(e, &temp_path))?;
            file.write_all(serialized.as_bytes())
                .map_err(|e| DroverError::io_with_path(e, &temp_path))?;
            file.sync_all()
                .map_err(|e| DroverError::io_with_path(e, &temp_path))?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| DroverError::Io {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                self.path.display()
            ),
            path: Some(self.path.clone()),
            source: Some(e),
        })?;

        debug!("Persisted {} programs to {}", programs.len(), self.path.display());
        Ok(())
    }
}
