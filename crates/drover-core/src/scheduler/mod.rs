//! Socket scheduler.
//!
//! Owns the supervisor's real listening sockets and shares them across
//! workers. Each endpoint is a reference-counted entry keyed by
//! `address:port:type:fd`; it exists exactly while at least one worker is a
//! member.
//!
//! # Strategies
//!
//! - **Shared**: every member receives a duplicate of the listening handle
//!   and the kernel balances accepts. Always used for datagram sockets.
//! - **Round-robin**: the supervisor accepts and hands each connection to
//!   exactly one idle worker (see [`round_robin`]).
//!
//! All methods run synchronously on the supervisor's event loop. Accepted
//! connections arrive from per-entry accept tasks as [`AcceptedConnection`]
//! values which the loop feeds back through [`Scheduler::on_accepted`].

mod round_robin;
mod shared;
mod socket;

use crate::config::SchedulingPolicy;
use crate::error::Result;
use crate::ipc::message::{AddressType, SchedulerMessage, ServerInfo};
use crate::ipc::transport::Outbox;
use crate::WorkerId;
use round_robin::RoundRobinHandle;
use shared::SharedHandle;
use socket::StreamListener;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identity of one shared endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchedulerKey {
    pub address: String,
    pub port: u16,
    pub address_type: AddressType,
    /// Descriptor already open in the supervisor to use instead of binding.
    pub fd: Option<i32>,
}

impl std::fmt::Display for SchedulerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.address,
            self.port,
            self.address_type,
            self.fd.unwrap_or(-1)
        )
    }
}

/// A connection accepted by a round-robin entry's accept task.
#[derive(Debug)]
pub struct AcceptedConnection {
    key: String,
    entry: u64,
    fd: OwnedFd,
}

#[derive(Debug)]
enum Strategy {
    Shared(SharedHandle),
    RoundRobin(RoundRobinHandle),
}

#[derive(Debug)]
struct Entry {
    id: u64,
    key: SchedulerKey,
    info: ServerInfo,
    members: HashMap<WorkerId, usize>,
    strategy: Strategy,
}

/// Scheduler state, owned by the supervisor.
#[derive(Debug)]
pub struct Scheduler {
    policy: SchedulingPolicy,
    entries: HashMap<String, Entry>,
    next_entry_id: u64,
    next_handoff: u64,
    accepted_tx: mpsc::UnboundedSender<AcceptedConnection>,
}

impl Scheduler {
    pub fn new(
        policy: SchedulingPolicy,
        accepted_tx: mpsc::UnboundedSender<AcceptedConnection>,
    ) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            next_entry_id: 0,
            next_handoff: 0,
            accepted_tx,
        }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    /// Handle `queryServer`: join `worker` to the entry for `key`, creating
    /// and binding it if needed, and acknowledge with `seq`.
    ///
    /// Bind failures are acknowledged with a non-zero errno and leave no
    /// entry behind.
    pub fn query_server(
        &mut self,
        worker: WorkerId,
        seq: u64,
        key: SchedulerKey,
        outbox: &mut dyn Outbox,
    ) {
        let name = key.to_string();

        if !self.entries.contains_key(&name) {
            match self.create_entry(&name, key) {
                Ok(entry) => {
                    info!("Scheduler entry {} created ({:?})", name, entry.info);
                    self.entries.insert(name.clone(), entry);
                }
                Err(e) => {
                    warn!("Worker {} cannot bind {}: {}", worker, name, e);
                    let ack = SchedulerMessage::ServerAck {
                        seq,
                        key: name,
                        errno: e.errno().unwrap_or(libc::EINVAL),
                        data: None,
                    };
                    if let Err(e) = outbox.send(worker, ack.into(), None) {
                        debug!("Could not deliver bind error to worker {}: {}", worker, e);
                    }
                    return;
                }
            }
        }

        let Some(entry) = self.entries.get_mut(&name) else {
            return;
        };
        let refs = entry.members.entry(worker).or_insert(0);
        *refs += 1;
        let first_membership = *refs == 1;

        match &mut entry.strategy {
            Strategy::Shared(handle) => {
                let (errno, fd) = match handle.assign() {
                    Ok(fd) => (0, Some(fd)),
                    Err(e) => {
                        warn!("Cannot duplicate {} for worker {}: {}", name, worker, e);
                        (e.raw_os_error().unwrap_or(libc::EMFILE), None)
                    }
                };
                let ack = SchedulerMessage::ServerAck {
                    seq,
                    key: name.clone(),
                    errno,
                    data: fd.is_some().then(|| entry.info.clone()),
                };
                if let Err(e) = outbox.send(worker, ack.into(), fd) {
                    debug!("Could not deliver handle to worker {}: {}", worker, e);
                }
                if errno != 0 {
                    self.release(worker, &name, outbox);
                }
            }
            Strategy::RoundRobin(rr) => {
                let ack = SchedulerMessage::ServerAck {
                    seq,
                    key: name.clone(),
                    errno: 0,
                    data: Some(entry.info.clone()),
                };
                if let Err(e) = outbox.send(worker, ack.into(), None) {
                    debug!("Could not acknowledge worker {}: {}", worker, e);
                }
                if first_membership {
                    rr.add(worker, &mut self.next_handoff, outbox);
                }
            }
        }
    }

    /// Handle `handoffAck`.
    pub fn handoff_ack(
        &mut self,
        worker: WorkerId,
        key: &str,
        handoff: u64,
        accepted: bool,
        outbox: &mut dyn Outbox,
    ) {
        let Some(entry) = self.entries.get_mut(key) else {
            debug!("Handoff ack for vanished entry {}", key);
            return;
        };
        if !entry.members.contains_key(&worker) {
            debug!("Handoff ack from non-member {} on {}", worker, key);
            return;
        }
        if let Strategy::RoundRobin(rr) = &mut entry.strategy {
            rr.acknowledge(worker, handoff, accepted, &mut self.next_handoff, outbox);
        }
    }

    /// Handle `close`: drop one of `worker`'s memberships in `key`.
    pub fn release(&mut self, worker: WorkerId, key: &str, outbox: &mut dyn Outbox) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let Some(refs) = entry.members.get_mut(&worker) else {
            return;
        };
        *refs -= 1;
        if *refs == 0 {
            self.leave(worker, key, outbox);
        }
    }

    /// Drop every membership `worker` holds, as on process exit.
    pub fn remove_worker(&mut self, worker: WorkerId, outbox: &mut dyn Outbox) {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.members.contains_key(&worker))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.leave(worker, &key, outbox);
        }
    }

    /// Feed a connection from an accept task into its entry.
    pub fn on_accepted(&mut self, conn: AcceptedConnection, outbox: &mut dyn Outbox) {
        match self.entries.get_mut(&conn.key) {
            Some(entry) if entry.id == conn.entry => {
                if let Strategy::RoundRobin(rr) = &mut entry.strategy {
                    rr.enqueue(conn.fd, &mut self.next_handoff, outbox);
                }
            }
            _ => debug!("Closing connection accepted by retired entry {}", conn.key),
        }
    }

    fn leave(&mut self, worker: WorkerId, key: &str, outbox: &mut dyn Outbox) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.members.remove(&worker);
        if let Strategy::RoundRobin(rr) = &mut entry.strategy {
            rr.remove(worker, &mut self.next_handoff, outbox);
        }
        if entry.members.is_empty() {
            self.destroy(key);
        }
    }

    fn destroy(&mut self, key: &str) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        let bound_path = (entry.key.address_type == AddressType::Unix && entry.key.fd.is_none())
            .then(|| entry.key.address.clone());
        drop(entry);

        if let Some(path) = bound_path {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("Could not remove socket file {}: {}", path, e);
            }
        }
        info!("Scheduler entry {} destroyed", key);
    }

    fn create_entry(&mut self, name: &str, key: SchedulerKey) -> Result<Entry> {
        let (fd, info) = socket::open(&key)?;
        self.next_entry_id += 1;
        let id = self.next_entry_id;

        let strategy = if key.address_type.is_datagram() || self.policy == SchedulingPolicy::Shared
        {
            Strategy::Shared(SharedHandle::new(fd))
        } else {
            let listener = StreamListener::from_fd(key.address_type, fd)?;
            let task = tokio::spawn(accept_loop(
                listener,
                name.to_string(),
                id,
                self.accepted_tx.clone(),
            ));
            Strategy::RoundRobin(RoundRobinHandle::new(name.to_string(), Some(task)))
        };

        Ok(Entry {
            id,
            key,
            info,
            members: HashMap::new(),
            strategy,
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of workers that are members of `key`.
    pub fn ref_count(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.members.len())
    }

    /// Creation serial of the entry for `key`; a re-created entry gets a
    /// new one.
    pub fn entry_id(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.id)
    }
}

async fn accept_loop(
    listener: StreamListener,
    key: String,
    entry: u64,
    tx: mpsc::UnboundedSender<AcceptedConnection>,
) {
    loop {
        match listener.accept().await {
            Ok(fd) => {
                let conn = AcceptedConnection {
                    key: key.clone(),
                    entry,
                    fd,
                };
                if tx.send(conn).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Accept failed on {}: {}", key, e);
                // back off on descriptor exhaustion
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::Envelope;
    use crate::testing::RecordingOutbox;
    use std::collections::HashSet;
    use std::time::Duration;

    fn acks(outbox: &RecordingOutbox) -> Vec<(WorkerId, i32, Option<ServerInfo>, bool)> {
        outbox
            .sent
            .iter()
            .filter_map(|(worker, envelope, fd)| match envelope {
                Envelope::Scheduler(SchedulerMessage::ServerAck { errno, data, .. }) => {
                    Some((*worker, *errno, data.clone(), fd.is_some()))
                }
                _ => None,
            })
            .collect()
    }

    fn handoffs(outbox: &RecordingOutbox) -> Vec<(WorkerId, String, u64)> {
        outbox
            .sent
            .iter()
            .filter_map(|(worker, envelope, _)| match envelope {
                Envelope::Scheduler(SchedulerMessage::NewConn { key, seq }) => {
                    Some((*worker, key.clone(), *seq))
                }
                _ => None,
            })
            .collect()
    }

    fn tcp_key(port: u16) -> SchedulerKey {
        SchedulerKey {
            address: "127.0.0.1".into(),
            port,
            address_type: AddressType::Tcp4,
            fd: None,
        }
    }

    fn scheduler(policy: SchedulingPolicy) -> (Scheduler, mpsc::UnboundedReceiver<AcceptedConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Scheduler::new(policy, tx), rx)
    }

    #[test]
    fn test_key_format() {
        let mut key = tcp_key(8080);
        assert_eq!(key.to_string(), "127.0.0.1:8080:tcp4:-1");
        key.fd = Some(3);
        assert_eq!(key.to_string(), "127.0.0.1:8080:tcp4:3");
    }

    #[tokio::test]
    async fn test_shared_entry_is_reference_counted() {
        let (mut sched, _rx) = scheduler(SchedulingPolicy::Shared);
        let mut outbox = RecordingOutbox::default();
        let key = tcp_key(0);
        let name = key.to_string();

        for worker in 1..=3 {
            sched.query_server(worker, worker, key.clone(), &mut outbox);
        }

        let acks = acks(&outbox);
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|(_, errno, _, has_fd)| *errno == 0 && *has_fd));
        let ports: HashSet<u16> = acks.iter().map(|(_, _, data, _)| data.as_ref().unwrap().port).collect();
        assert_eq!(ports.len(), 1);
        assert_eq!(sched.ref_count(&name), 3);

        let first_id = sched.entry_id(&name).unwrap();
        for worker in 1..=3 {
            sched.remove_worker(worker, &mut outbox);
        }
        assert_eq!(sched.ref_count(&name), 0);
        assert!(sched.is_empty());

        sched.query_server(4, 1, key, &mut outbox);
        assert_ne!(sched.entry_id(&name), Some(first_id));
    }

    #[tokio::test]
    async fn test_datagram_keys_are_always_shared() {
        let (mut sched, _rx) = scheduler(SchedulingPolicy::RoundRobin);
        let mut outbox = RecordingOutbox::default();
        let key = SchedulerKey {
            address: "127.0.0.1".into(),
            port: 0,
            address_type: AddressType::Udp4,
            fd: None,
        };

        sched.query_server(1, 1, key, &mut outbox);
        let acks = acks(&outbox);
        assert_eq!(acks.len(), 1);
        assert!(acks[0].3, "udp members receive the socket itself");
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported_and_leaves_no_entry() {
        let (mut sched, _rx) = scheduler(SchedulingPolicy::RoundRobin);
        let mut outbox = RecordingOutbox::default();

        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        sched.query_server(1, 5, tcp_key(port), &mut outbox);

        let acks = acks(&outbox);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].1, libc::EADDRINUSE);
        assert!(sched.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_release_counts_down() {
        let (mut sched, _rx) = scheduler(SchedulingPolicy::Shared);
        let mut outbox = RecordingOutbox::default();
        let key = tcp_key(0);
        let name = key.to_string();

        sched.query_server(1, 1, key.clone(), &mut outbox);
        sched.query_server(1, 2, key.clone(), &mut outbox);
        sched.query_server(2, 1, key, &mut outbox);
        assert_eq!(sched.ref_count(&name), 2);

        sched.release(1, &name, &mut outbox);
        assert_eq!(sched.ref_count(&name), 2);
        sched.release(1, &name, &mut outbox);
        assert_eq!(sched.ref_count(&name), 1);
        sched.release(2, &name, &mut outbox);
        assert!(sched.is_empty());
    }

    #[tokio::test]
    async fn test_round_robin_hands_connections_to_distinct_workers() {
        let (mut sched, mut rx) = scheduler(SchedulingPolicy::RoundRobin);
        let mut outbox = RecordingOutbox::default();
        let key = tcp_key(0);
        let name = key.to_string();

        for worker in 1..=3 {
            sched.query_server(worker, 1, key.clone(), &mut outbox);
        }
        let acks = acks(&outbox);
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|(_, errno, _, has_fd)| *errno == 0 && !*has_fd));
        let port = acks[0].2.as_ref().unwrap().port;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap());
            let conn = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            sched.on_accepted(conn, &mut outbox);
        }

        let handoffs = handoffs(&outbox);
        assert_eq!(handoffs.len(), 3);
        let workers: HashSet<WorkerId> = handoffs.iter().map(|(w, _, _)| *w).collect();
        assert_eq!(workers.len(), 3);

        for (worker, key, seq) in handoffs {
            sched.handoff_ack(worker, &key, seq, true, &mut outbox);
        }
        assert_eq!(sched.ref_count(&name), 3);
    }

    #[tokio::test]
    async fn test_round_robin_entry_closes_listener_when_empty() {
        let (mut sched, _rx) = scheduler(SchedulingPolicy::RoundRobin);
        let mut outbox = RecordingOutbox::default();
        let key = tcp_key(0);

        sched.query_server(1, 1, key.clone(), &mut outbox);
        let port = acks(&outbox)[0].2.as_ref().unwrap().port;
        sched.remove_worker(1, &mut outbox);
        assert!(sched.is_empty());

        // the port is free again once the accept task has been torn down
        let mut rebound = false;
        for _ in 0..20 {
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                rebound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(rebound);
    }
}
