//! Test doubles shared by unit tests.

use crate::error::{DroverError, Result};
use crate::ipc::message::Envelope;
use crate::ipc::transport::Outbox;
use crate::WorkerId;
use std::collections::HashSet;
use std::os::fd::OwnedFd;

/// Records every delivery; workers in `dead` fail like exited processes.
#[derive(Debug, Default)]
pub(crate) struct RecordingOutbox {
    pub sent: Vec<(WorkerId, Envelope, Option<OwnedFd>)>,
    pub dead: HashSet<WorkerId>,
}

impl Outbox for RecordingOutbox {
    fn send(&mut self, worker: WorkerId, envelope: Envelope, fd: Option<OwnedFd>) -> Result<()> {
        if self.dead.contains(&worker) {
            return Err(DroverError::ipc(format!("worker {} is gone", worker)));
        }
        self.sent.push((worker, envelope, fd));
        Ok(())
    }
}

impl RecordingOutbox {
    /// Messages delivered to `worker`, in order.
    pub fn to(&self, worker: WorkerId) -> Vec<&Envelope> {
        self.sent
            .iter()
            .filter(|(w, _, _)| *w == worker)
            .map(|(_, envelope, _)| envelope)
            .collect()
    }
}
