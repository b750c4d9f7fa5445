//! Program manifests.
//!
//! The supervisor only needs a program's resolved launch parameters; where
//! they come from is behind [`ManifestResolver`]. The default resolver reads
//! `<dir>/drover.json`:
//!
//! ```json
//! { "command": "./server", "args": ["--port", "8080"], "workers": 4,
//!   "env": { "MODE": "prod" }, "stdout": "logs/out.log", "stderr": "logs/err.log" }
//! ```

use crate::config::SupervisorConfig;
use crate::error::{DroverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Resolved launch parameters for one program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramManifest {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

fn default_workers() -> usize {
    1
}

impl ProgramManifest {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workers: 1,
            env: BTreeMap::new(),
            stdout: None,
            stderr: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    /// Check the manifest and anchor relative paths at `dir`.
    pub fn resolve_in(mut self, dir: &Path) -> Result<Self> {
        if self.workers == 0 {
            return Err(DroverError::Manifest {
                dir: dir.to_path_buf(),
                message: "workers must be at least 1".to_string(),
            });
        }
        if self.command.as_os_str().is_empty() {
            return Err(DroverError::Manifest {
                dir: dir.to_path_buf(),
                message: "command must not be empty".to_string(),
            });
        }
        // bare names are looked up on PATH
        if self.command.is_relative() && self.command.components().count() > 1 {
            self.command = dir.join(&self.command);
        }
        self.stdout = self.stdout.map(|p| anchor(dir, p));
        self.stderr = self.stderr.map(|p| anchor(dir, p));
        Ok(self)
    }
}

fn anchor(dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        dir.join(path)
    }
}

/// Source of program manifests.
pub trait ManifestResolver: Send + Sync + 'static {
    fn resolve(&self, dir: &Path) -> Result<ProgramManifest>;
}

/// Reads `drover.json` from the program directory.
#[derive(Debug, Clone, Default)]
pub struct JsonManifestResolver;

impl ManifestResolver for JsonManifestResolver {
    fn resolve(&self, dir: &Path) -> Result<ProgramManifest> {
        let path = dir.join(SupervisorConfig::MANIFEST_FILE_NAME);
        let contents = std::fs::read_to_string(&path).map_err(|e| DroverError::Manifest {
            dir: dir.to_path_buf(),
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let manifest: ProgramManifest =
            serde_json::from_str(&contents).map_err(|e| DroverError::Manifest {
                dir: dir.to_path_buf(),
                message: format!("cannot parse {}: {}", path.display(), e),
            })?;
        manifest.resolve_in(dir)
    }
}

/// Resolves every directory to the same manifest. Handy for embedding and
/// tests.
#[derive(Debug, Clone)]
pub struct StaticManifestResolver {
    manifest: ProgramManifest,
}

impl StaticManifestResolver {
    pub fn new(manifest: ProgramManifest) -> Self {
        Self { manifest }
    }
}

impl ManifestResolver for StaticManifestResolver {
    fn resolve(&self, dir: &Path) -> Result<ProgramManifest> {
        self.manifest.clone().resolve_in(dir)
    }
}
