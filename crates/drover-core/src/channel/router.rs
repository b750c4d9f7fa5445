//! Supervisor-side fan-out and aggregation of channel traffic.
//!
//! A query from a worker is re-issued to each sibling under a fresh
//! supervisor sequence number. Answers are matched back by that number and
//! the aggregate is returned to the originator once every sibling has
//! answered or the query window has elapsed. Siblings that miss the window
//! simply do not contribute.

use crate::ipc::message::{ChannelMessage, ChannelStatus};
use crate::ipc::transport::Outbox;
use crate::WorkerId;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where an aggregated answer goes.
#[derive(Debug)]
pub enum QueryOrigin {
    /// A worker's query, to be answered with `queryback` under its own seq.
    Worker { worker: WorkerId, seq: u64 },
    /// A query issued by the supervisor itself.
    Local(oneshot::Sender<Vec<Value>>),
}

#[derive(Debug)]
struct PendingQuery {
    channel: String,
    origin: QueryOrigin,
    results: Vec<Value>,
    awaiting: HashSet<WorkerId>,
    expiry: JoinHandle<()>,
}

/// In-flight query table.
#[derive(Debug)]
pub struct ChannelRouter {
    pending: HashMap<u64, PendingQuery>,
    next_seq: u64,
    timeout: Duration,
    expired_tx: mpsc::UnboundedSender<u64>,
}

impl ChannelRouter {
    /// Expired query numbers are posted to `expired_tx`; the owner feeds
    /// them back through [`expire`](Self::expire).
    pub fn new(timeout: Duration, expired_tx: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            pending: HashMap::new(),
            next_seq: 0,
            timeout,
            expired_tx,
        }
    }

    /// Fan a query out to `siblings`. `initial` holds answers already known
    /// to the caller. With no reachable sibling the origin is answered
    /// immediately.
    pub fn query(
        &mut self,
        origin: QueryOrigin,
        channel: &str,
        initial: Vec<Value>,
        siblings: &[WorkerId],
        outbox: &mut dyn Outbox,
    ) {
        self.next_seq += 1;
        let seq = self.next_seq;

        let mut awaiting = HashSet::new();
        for &sibling in siblings {
            let message = ChannelMessage::Query {
                channel: channel.to_string(),
                seq,
            };
            match outbox.send(sibling, message.into(), None) {
                Ok(()) => {
                    awaiting.insert(sibling);
                }
                Err(e) => warn!("Skipping sibling {} for query on {}: {}", sibling, channel, e),
            }
        }

        if awaiting.is_empty() {
            complete(origin, channel, initial, outbox);
            return;
        }

        let tx = self.expired_tx.clone();
        let timeout = self.timeout;
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(seq);
        });

        self.pending.insert(
            seq,
            PendingQuery {
                channel: channel.to_string(),
                origin,
                results: initial,
                awaiting,
                expiry,
            },
        );
    }

    /// Record a sibling's answer.
    pub fn queryback(
        &mut self,
        from: WorkerId,
        ack: u64,
        status: ChannelStatus,
        result: Option<Value>,
        outbox: &mut dyn Outbox,
    ) {
        let Some(query) = self.pending.get_mut(&ack) else {
            debug!("Late or unknown queryback {} from worker {}", ack, from);
            return;
        };
        if !query.awaiting.remove(&from) {
            debug!("Unexpected queryback {} from worker {}", ack, from);
            return;
        }
        if let (ChannelStatus::Ok, Some(value)) = (status, result) {
            query.results.push(value);
        }
        if query.awaiting.is_empty() {
            self.finish(ack, outbox);
        }
    }

    /// The window for `seq` has elapsed; answer with what has arrived.
    pub fn expire(&mut self, seq: u64, outbox: &mut dyn Outbox) {
        if let Some(query) = self.pending.get(&seq) {
            debug!(
                "Query {} on {} timed out waiting for {} siblings",
                seq,
                query.channel,
                query.awaiting.len()
            );
            self.finish(seq, outbox);
        }
    }

    /// A worker is gone: stop waiting for it, and drop queries it
    /// originated.
    pub fn forget_worker(&mut self, worker: WorkerId, outbox: &mut dyn Outbox) {
        let orphaned: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, q)| matches!(q.origin, QueryOrigin::Worker { worker: w, .. } if w == worker))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in orphaned {
            if let Some(query) = self.pending.remove(&seq) {
                query.expiry.abort();
            }
        }

        let mut ready = Vec::new();
        for (seq, query) in self.pending.iter_mut() {
            if query.awaiting.remove(&worker) && query.awaiting.is_empty() {
                ready.push(*seq);
            }
        }
        for seq in ready {
            self.finish(seq, outbox);
        }
    }

    /// Broadcast to `targets`. Returns how many sends succeeded.
    pub fn dispatch(
        &mut self,
        channel: &str,
        data: &Value,
        targets: &[WorkerId],
        outbox: &mut dyn Outbox,
    ) -> usize {
        let mut delivered = 0;
        for &target in targets {
            let message = ChannelMessage::Dispatch {
                channel: channel.to_string(),
                data: data.clone(),
            };
            match outbox.send(target, message.into(), None) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Skipping worker {} for dispatch on {}: {}", target, channel, e),
            }
        }
        delivered
    }

    /// Number of queries still waiting for answers.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn finish(&mut self, seq: u64, outbox: &mut dyn Outbox) {
        if let Some(query) = self.pending.remove(&seq) {
            query.expiry.abort();
            complete(query.origin, &query.channel, query.results, outbox);
        }
    }
}

fn complete(origin: QueryOrigin, channel: &str, results: Vec<Value>, outbox: &mut dyn Outbox) {
    match origin {
        QueryOrigin::Worker { worker, seq } => {
            let message = ChannelMessage::Queryback {
                channel: channel.to_string(),
                ack: seq,
                status: ChannelStatus::Ok,
                result: Some(Value::Array(results)),
            };
            if let Err(e) = outbox.send(worker, message.into(), None) {
                warn!("Query originator {} is gone: {}", worker, e);
            }
        }
        QueryOrigin::Local(tx) => {
            let _ = tx.send(results);
        }
    }
}
