//! Program and worker records.

use super::respawn::RespawnTracker;
use crate::manifest::ProgramManifest;
use crate::persist::PersistedProgram;
use crate::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One worker slot of a program.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    /// Live worker, or `None` while the slot is disabled or respawning.
    pub worker: Option<WorkerId>,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub tracker: RespawnTracker,
    /// The current worker was asked to exit by `restart`/`reload`.
    pub restart_requested: bool,
}

/// A managed program, keyed by its directory.
#[derive(Debug)]
pub(crate) struct Program {
    /// Distinguishes this instance from earlier ones for the same directory.
    pub instance: u64,
    pub dir: PathBuf,
    pub manifest: ProgramManifest,
    pub slots: Vec<Slot>,
    pub started_at: DateTime<Utc>,
    pub restarted_at: Option<DateTime<Utc>>,
    pub reloads: u32,
    pub reloaded_at: Option<DateTime<Utc>>,
}

impl Program {
    pub fn new(instance: u64, dir: &Path, manifest: ProgramManifest) -> Self {
        let slots = (0..manifest.workers).map(|_| Slot::default()).collect();
        Self {
            instance,
            dir: dir.to_path_buf(),
            manifest,
            slots,
            started_at: Utc::now(),
            restarted_at: None,
            reloads: 0,
            reloaded_at: None,
        }
    }

    /// Ids of every live worker.
    pub fn workers(&self) -> Vec<WorkerId> {
        self.slots.iter().filter_map(|slot| slot.worker).collect()
    }

    #[cfg(test)]
    pub fn slot_of(&self, worker: WorkerId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.worker == Some(worker))
    }

    pub fn persisted(&self) -> PersistedProgram {
        PersistedProgram {
            dir: self.dir.clone(),
            stdout: self.manifest.stdout.clone(),
            stderr: self.manifest.stderr.clone(),
        }
    }

    pub fn status(&self) -> ProgramStatus {
        ProgramStatus {
            dir: self.dir.clone(),
            workers: self.slots.len(),
            alive: self.slots.iter().filter(|slot| slot.worker.is_some()).count(),
            pids: self.slots.iter().map(|slot| slot.pid).collect(),
            restarts: self.slots.iter().map(|slot| slot.restarts).collect(),
            started_at: self.started_at,
            restarted_at: self.restarted_at,
            reloads: self.reloads,
            reloaded_at: self.reloaded_at,
            stdout: self.manifest.stdout.clone(),
            stderr: self.manifest.stderr.clone(),
        }
    }
}

/// Status report for one program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramStatus {
    pub dir: PathBuf,
    /// Configured slot count.
    pub workers: usize,
    /// Slots with a live worker.
    pub alive: usize,
    /// Per slot; `None` while disabled.
    pub pids: Vec<Option<u32>>,
    pub restarts: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub restarted_at: Option<DateTime<Utc>>,
    pub reloads: u32,
    pub reloaded_at: Option<DateTime<Utc>>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Supervisor-side record of one live worker process.
#[derive(Debug, Clone)]
pub(crate) struct WorkerRecord {
    pub dir: PathBuf,
    pub instance: u64,
    pub slot: usize,
    pub pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reflects_slots() {
        let manifest = ProgramManifest::new("/bin/true")
            .with_workers(3)
            .with_stdout("/srv/app/out.log");
        let mut program = Program::new(1, Path::new("/srv/app"), manifest);
        program.slots[0].worker = Some(10);
        program.slots[0].pid = Some(1000);
        program.slots[2].worker = Some(12);
        program.slots[2].pid = Some(1002);
        program.slots[2].restarts = 4;

        let status = program.status();
        assert_eq!(status.workers, 3);
        assert_eq!(status.alive, 2);
        assert_eq!(status.pids, vec![Some(1000), None, Some(1002)]);
        assert_eq!(status.restarts, vec![0, 0, 4]);
        assert_eq!(status.stdout, Some(PathBuf::from("/srv/app/out.log")));

        assert_eq!(program.workers(), vec![10, 12]);
        assert_eq!(program.slot_of(12), Some(2));
        assert_eq!(program.slot_of(11), None);
    }

    #[test]
    fn test_persisted_form() {
        let manifest = ProgramManifest::new("/bin/true").with_stderr("/tmp/err.log");
        let program = Program::new(1, Path::new("/srv/app"), manifest);
        let persisted = program.persisted();
        assert_eq!(persisted.dir, PathBuf::from("/srv/app"));
        assert_eq!(persisted.stdout, None);
        assert_eq!(persisted.stderr, Some(PathBuf::from("/tmp/err.log")));
    }
}
