//! Round-robin strategy: the supervisor accepts, workers are handed
//! individual connections.
//!
//! A worker sits in the idle queue until it is given a connection, and goes
//! back once it acknowledges the handoff. Accepted connections wait in the
//! pending queue while no worker is idle. The supervisor keeps its own copy
//! of a handed-off connection until the ack arrives, so a declined
//! connection can be offered to someone else.

use crate::config::SchedulerConfig;
use crate::ipc::message::SchedulerMessage;
use crate::ipc::transport::Outbox;
use crate::WorkerId;
use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
struct PendingConnection {
    fd: OwnedFd,
    declines: u32,
}

#[derive(Debug)]
struct InFlight {
    worker: WorkerId,
    conn: PendingConnection,
}

#[derive(Debug)]
pub(crate) struct RoundRobinHandle {
    key: String,
    idle: VecDeque<WorkerId>,
    pending: VecDeque<PendingConnection>,
    in_flight: HashMap<u64, InFlight>,
    accept_task: Option<JoinHandle<()>>,
}

impl RoundRobinHandle {
    pub(crate) fn new(key: String, accept_task: Option<JoinHandle<()>>) -> Self {
        Self {
            key,
            idle: VecDeque::new(),
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            accept_task,
        }
    }

    /// A new member becomes available for handoffs.
    pub(crate) fn add(&mut self, worker: WorkerId, seq: &mut u64, outbox: &mut dyn Outbox) {
        if !self.idle.contains(&worker) && !self.is_busy(worker) {
            self.idle.push_back(worker);
        }
        self.distribute(seq, outbox);
    }

    /// A connection was accepted on the real listener.
    pub(crate) fn enqueue(&mut self, fd: OwnedFd, seq: &mut u64, outbox: &mut dyn Outbox) {
        self.pending.push_back(PendingConnection { fd, declines: 0 });
        self.distribute(seq, outbox);
    }

    /// Drop a member. Connections in flight to it go back to the front of
    /// the pending queue.
    pub(crate) fn remove(&mut self, worker: WorkerId, seq: &mut u64, outbox: &mut dyn Outbox) {
        self.idle.retain(|w| *w != worker);

        let mut orphaned: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.worker == worker)
            .map(|(id, _)| *id)
            .collect();
        orphaned.sort_unstable();
        for id in orphaned.into_iter().rev() {
            if let Some(flight) = self.in_flight.remove(&id) {
                debug!("Re-queueing connection {} from departed worker {}", id, worker);
                self.pending.push_front(flight.conn);
            }
        }

        self.distribute(seq, outbox);
    }

    /// Handle a worker's answer to `newconn`.
    pub(crate) fn acknowledge(
        &mut self,
        worker: WorkerId,
        handoff: u64,
        accepted: bool,
        seq: &mut u64,
        outbox: &mut dyn Outbox,
    ) {
        let Some(flight) = self.in_flight.remove(&handoff) else {
            debug!("Ignoring ack for unknown handoff {} on {}", handoff, self.key);
            return;
        };
        if flight.worker != worker {
            warn!(
                "Worker {} acknowledged handoff {} owned by worker {}",
                worker, handoff, flight.worker
            );
            self.in_flight.insert(handoff, flight);
            return;
        }

        if !accepted {
            let mut conn = flight.conn;
            conn.declines += 1;
            if conn.declines >= SchedulerConfig::MAX_HANDOFF_ATTEMPTS {
                warn!(
                    "Closing connection on {} after {} declined handoffs",
                    self.key, conn.declines
                );
            } else {
                warn!("Worker {} declined a connection on {}", worker, self.key);
                self.pending.push_back(conn);
            }
        }

        if !self.idle.contains(&worker) && !self.is_busy(worker) {
            self.idle.push_back(worker);
        }
        self.distribute(seq, outbox);
    }

    fn is_busy(&self, worker: WorkerId) -> bool {
        self.in_flight.values().any(|flight| flight.worker == worker)
    }

    fn distribute(&mut self, seq: &mut u64, outbox: &mut dyn Outbox) {
        while !self.pending.is_empty() {
            let Some(worker) = self.idle.pop_front() else {
                break;
            };
            let Some(conn) = self.pending.pop_front() else {
                self.idle.push_front(worker);
                break;
            };
            self.handoff(worker, conn, seq, outbox);
        }
    }

    fn handoff(
        &mut self,
        worker: WorkerId,
        conn: PendingConnection,
        seq: &mut u64,
        outbox: &mut dyn Outbox,
    ) {
        *seq += 1;
        let id = *seq;

        let copy = match conn.fd.try_clone() {
            Ok(copy) => copy,
            Err(e) => {
                warn!("Dropping connection on {}: cannot duplicate: {}", self.key, e);
                self.idle.push_front(worker);
                return;
            }
        };

        let message = SchedulerMessage::NewConn {
            key: self.key.clone(),
            seq: id,
        };
        match outbox.send(worker, message.into(), Some(copy)) {
            Ok(()) => {
                self.in_flight.insert(id, InFlight { worker, conn });
            }
            Err(e) => {
                // the worker is exiting; its removal will follow
                debug!("Handoff to worker {} failed: {}", worker, e);
                self.pending.push_front(conn);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.idle.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for RoundRobinHandle {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if !self.pending.is_empty() || !self.in_flight.is_empty() {
            debug!(
                "Closing {} undelivered connections on {}",
                self.pending.len() + self.in_flight.len(),
                self.key
            );
        }
    }
}
