//! Worker-side runtime.
//!
//! A process started by the supervisor adopts its inherited channel with
//! [`WorkerRuntime::from_env`]. The runtime then:
//!
//! - answers channel queries from siblings with its registered providers
//! - runs its listeners for broadcasts from siblings
//! - turns `listen` / `bind_udp` into scheduler requests and delivers
//!   round-robin handoffs to the matching [`SharedListener`]
//!
//! One background task reads the channel; everything it needs is behind
//! [`Link`], which is shared with the runtime and its listeners.

mod listener;

pub use listener::{SharedListener, SharedStream};

use crate::channel::ChannelRegistry;
use crate::config::{ChannelConfig, IpcConfig};
use crate::error::{DroverError, Result};
use crate::ipc::message::{
    AddressType, ChannelMessage, ChannelStatus, Envelope, SchedulerMessage, ServerInfo,
};
use crate::ipc::transport::{IpcChannel, IpcSender, Packet};
use crate::WorkerId;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// What the supervisor granted for a `queryServer`.
#[derive(Debug)]
pub(crate) enum Grant {
    /// Shared strategy: our own duplicate of the listening socket.
    Shared {
        key: String,
        info: Option<ServerInfo>,
        fd: OwnedFd,
    },
    /// Round-robin strategy: connections arrive as handoffs.
    Handoff {
        key: String,
        member: u64,
        info: Option<ServerInfo>,
        conns: mpsc::UnboundedReceiver<OwnedFd>,
    },
}

/// Local listeners joined to one round-robin key. Handoffs rotate between
/// them.
#[derive(Debug, Default)]
struct HandoffMembers {
    listeners: Vec<(u64, mpsc::UnboundedSender<OwnedFd>)>,
    next: usize,
}

impl HandoffMembers {
    /// Give `fd` to the next live listener. Listeners whose receiver is gone
    /// are dropped on the way.
    fn deliver(&mut self, mut fd: OwnedFd) -> bool {
        while !self.listeners.is_empty() {
            let index = self.next % self.listeners.len();
            match self.listeners[index].1.send(fd) {
                Ok(()) => {
                    self.next = index + 1;
                    return true;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.listeners.remove(index);
                    fd = returned;
                }
            }
        }
        false
    }
}

type GrantReply = oneshot::Sender<Result<Grant>>;

/// State shared between the runtime, its listeners and the reader task.
pub(crate) struct Link {
    sender: IpcSender,
    registry: RwLock<ChannelRegistry>,
    servers: Mutex<HashMap<u64, GrantReply>>,
    queries: Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
    handoffs: Mutex<HashMap<String, HandoffMembers>>,
    next_seq: AtomicU64,
    closed: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Link {
    fn registry(&self) -> RwLockReadGuard<'_, ChannelRegistry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, ChannelRegistry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Local answer for `channel`. The provider runs outside the lock.
    fn answer(&self, channel: &str) -> Option<Value> {
        let provider = self.registry().provider(channel);
        provider.map(|provider| provider())
    }

    /// Run local listeners for `channel` outside the lock.
    fn notify(&self, channel: &str, data: &Value) {
        let listeners = self.registry().listeners(channel);
        for listener in listeners {
            listener(data);
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn send(&self, envelope: impl Into<Envelope>, fd: Option<OwnedFd>) -> Result<()> {
        self.sender.send(envelope, fd)
    }

    /// Give up one membership in `key`. `member` names the round-robin
    /// listener going away; once none is left, handoffs for `key` are
    /// declined.
    pub(crate) fn release(&self, key: &str, member: Option<u64>) {
        if let Some(member) = member {
            let mut handoffs = lock(&self.handoffs);
            if let Some(members) = handoffs.get_mut(key) {
                members.listeners.retain(|(id, _)| *id != member);
                if members.listeners.is_empty() {
                    handoffs.remove(key);
                }
            }
        }
        if let Err(e) = self.send(SchedulerMessage::Close { key: key.to_string() }, None) {
            debug!("Could not release {}: {}", key, e);
        }
    }

    fn on_packet(&self, packet: Packet) {
        match packet.envelope {
            Envelope::Scheduler(message) => self.on_scheduler(message, packet.fd),
            Envelope::Channel(message) => self.on_channel(message),
        }
    }

    fn on_scheduler(&self, message: SchedulerMessage, fd: Option<OwnedFd>) {
        match message {
            SchedulerMessage::ServerAck {
                seq,
                key,
                errno,
                data,
            } => {
                let outcome = if errno != 0 {
                    Err(DroverError::Bind {
                        message: std::io::Error::from_raw_os_error(errno).to_string(),
                        key,
                        errno,
                    })
                } else if let Some(fd) = fd {
                    Ok(Grant::Shared {
                        key,
                        info: data,
                        fd,
                    })
                } else {
                    let (tx, conns) = mpsc::unbounded_channel();
                    let member = self.next_seq();
                    lock(&self.handoffs)
                        .entry(key.clone())
                        .or_default()
                        .listeners
                        .push((member, tx));
                    Ok(Grant::Handoff {
                        key,
                        member,
                        info: data,
                        conns,
                    })
                };

                let unclaimed = match lock(&self.servers).remove(&seq) {
                    Some(reply) => reply.send(outcome).err(),
                    None => Some(outcome),
                };
                if let Some(Ok(grant)) = unclaimed {
                    debug!("Nobody is waiting for server ack {}; releasing", seq);
                    self.release(grant.key(), grant.member());
                }
            }
            SchedulerMessage::NewConn { key, seq } => {
                let accepted = match fd {
                    Some(fd) => {
                        let mut handoffs = lock(&self.handoffs);
                        match handoffs.get_mut(&key) {
                            Some(members) => {
                                let delivered = members.deliver(fd);
                                if members.listeners.is_empty() {
                                    handoffs.remove(&key);
                                }
                                delivered
                            }
                            None => false,
                        }
                    }
                    None => {
                        warn!("Handoff {} on {} arrived without a connection", seq, key);
                        false
                    }
                };
                let ack = SchedulerMessage::HandoffAck {
                    key,
                    ack: seq,
                    accepted,
                };
                if let Err(e) = self.send(ack, None) {
                    debug!("Could not acknowledge handoff {}: {}", seq, e);
                }
            }
            other => debug!("Ignoring worker-bound scheduler message {:?}", other),
        }
    }

    fn on_channel(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::Query { channel, seq } => {
                let answer = self.answer(&channel);
                let status = if answer.is_some() {
                    ChannelStatus::Ok
                } else {
                    ChannelStatus::NoProvider
                };
                let reply = ChannelMessage::Queryback {
                    channel,
                    ack: seq,
                    status,
                    result: answer,
                };
                if let Err(e) = self.send(reply, None) {
                    debug!("Could not answer query {}: {}", seq, e);
                }
            }
            ChannelMessage::Dispatch { channel, data } => self.notify(&channel, &data),
            ChannelMessage::Queryback { ack, result, .. } => {
                let Some(reply) = lock(&self.queries).remove(&ack) else {
                    debug!("Late aggregate for query {}", ack);
                    return;
                };
                let values = match result {
                    Some(Value::Array(values)) => values,
                    Some(value) => vec![value],
                    None => Vec::new(),
                };
                let _ = reply.send(values);
            }
        }
    }

    /// The supervisor is gone: fail everything that waits on it.
    fn close(&self) {
        lock(&self.servers).clear();
        lock(&self.queries).clear();
        lock(&self.handoffs).clear();
        self.closed.send_replace(true);
    }
}

impl Grant {
    fn key(&self) -> &str {
        match self {
            Grant::Shared { key, .. } | Grant::Handoff { key, .. } => key,
        }
    }

    fn member(&self) -> Option<u64> {
        match self {
            Grant::Shared { .. } => None,
            Grant::Handoff { member, .. } => Some(*member),
        }
    }
}

/// Handle to the supervisor from inside a worker. Cheap to clone.
#[derive(Clone)]
pub struct WorkerRuntime {
    link: Arc<Link>,
    worker_id: WorkerId,
    slot: usize,
    program_dir: PathBuf,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("worker_id", &self.worker_id)
            .field("slot", &self.slot)
            .field("program_dir", &self.program_dir)
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    /// Adopt the channel and identity exported by the supervisor. Must be
    /// called inside a tokio runtime.
    pub fn from_env() -> Result<Self> {
        let channel = IpcChannel::from_env()?;
        let worker_id = env_number(IpcConfig::WORKER_ID_ENV)?;
        let slot = env_number(IpcConfig::WORKER_SLOT_ENV)?;
        let program_dir = match std::env::var_os(IpcConfig::PROGRAM_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()?,
        };
        Ok(Self::with_channel(channel, worker_id, slot as usize, program_dir))
    }

    /// Run over an already connected channel.
    pub fn with_channel(
        channel: IpcChannel,
        worker_id: WorkerId,
        slot: usize,
        program_dir: impl Into<PathBuf>,
    ) -> Self {
        let channel = Arc::new(channel);
        let (sender, _writer) = IpcSender::spawn(Arc::clone(&channel));
        let (closed, _) = watch::channel(false);
        let link = Arc::new(Link {
            sender,
            registry: RwLock::new(ChannelRegistry::new()),
            servers: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
            handoffs: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            closed,
        });
        tokio::spawn(read_loop(channel, Arc::clone(&link)));

        Self {
            link,
            worker_id,
            slot,
            program_dir: program_dir.into(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn program_dir(&self) -> &Path {
        &self.program_dir
    }

    /// Join the supervisor-owned endpoint for `address:port`.
    ///
    /// For `unix`, `address` is the socket path and `port` is ignored.
    pub async fn listen(
        &self,
        address: &str,
        port: u16,
        address_type: AddressType,
    ) -> Result<SharedListener> {
        if address_type.is_datagram() {
            return Err(DroverError::InvalidRequest {
                message: format!("{} is not a stream type; use bind_udp", address_type),
            });
        }
        let grant = self.query_server(address, port, address_type).await?;
        SharedListener::new(grant, address_type, Arc::clone(&self.link))
    }

    /// Get this worker's duplicate of a shared UDP socket.
    pub async fn bind_udp(&self, address: &str, port: u16) -> Result<tokio::net::UdpSocket> {
        let address_type = match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => AddressType::Udp6,
            _ => AddressType::Udp4,
        };
        match self.query_server(address, port, address_type).await? {
            Grant::Shared { fd, .. } => {
                let socket = std::net::UdpSocket::from(fd);
                socket.set_nonblocking(true)?;
                Ok(tokio::net::UdpSocket::from_std(socket)?)
            }
            Grant::Handoff { key, member, .. } => {
                self.link.release(&key, Some(member));
                Err(DroverError::ipc(format!("{} was not granted as shared", key)))
            }
        }
    }

    async fn query_server(
        &self,
        address: &str,
        port: u16,
        address_type: AddressType,
    ) -> Result<Grant> {
        let seq = self.link.next_seq();
        let (tx, rx) = oneshot::channel();
        lock(&self.link.servers).insert(seq, tx);

        let request = SchedulerMessage::QueryServer {
            seq,
            address: address.to_string(),
            port,
            address_type,
            fd: None,
        };
        if let Err(e) = self.link.send(request, None) {
            lock(&self.link.servers).remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(IpcConfig::SERVER_REPLY_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DroverError::SupervisorGone),
            Err(_) => {
                lock(&self.link.servers).remove(&seq);
                Err(DroverError::Timeout(IpcConfig::SERVER_REPLY_TIMEOUT))
            }
        }
    }

    pub fn register_provider(
        &self,
        channel: impl Into<String>,
        provider: impl Fn() -> Value + Send + Sync + 'static,
    ) {
        self.link
            .registry_mut()
            .register_provider(channel, Arc::new(provider));
    }

    pub fn register_listener(
        &self,
        channel: impl Into<String>,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) {
        self.link
            .registry_mut()
            .register_listener(channel, Arc::new(listener));
    }

    /// Every process's answer for `channel`: this worker's own first, then
    /// whatever siblings answered within the query window.
    ///
    /// Never fails; a lost supervisor or a missed window leaves only the
    /// local answer.
    pub async fn query(&self, channel: &str) -> Vec<Value> {
        let mut results: Vec<Value> = self.link.answer(channel).into_iter().collect();

        let seq = self.link.next_seq();
        let (tx, rx) = oneshot::channel();
        lock(&self.link.queries).insert(seq, tx);

        let request = ChannelMessage::Query {
            channel: channel.to_string(),
            seq,
        };
        if let Err(e) = self.link.send(request, None) {
            lock(&self.link.queries).remove(&seq);
            debug!("Query on {} answered locally: {}", channel, e);
            return results;
        }

        let window = ChannelConfig::QUERY_TIMEOUT + ChannelConfig::WORKER_QUERY_GRACE;
        match tokio::time::timeout(window, rx).await {
            Ok(Ok(values)) => results.extend(values),
            Ok(Err(_)) => debug!("Supervisor went away during query on {}", channel),
            Err(_) => {
                lock(&self.link.queries).remove(&seq);
                debug!("No aggregate for {} within {:?}", channel, window);
            }
        }
        results
    }

    /// Run local listeners for `channel`, then broadcast to every sibling.
    pub fn dispatch(&self, channel: &str, data: Value) -> Result<()> {
        self.link.notify(channel, &data);

        self.link.send(
            ChannelMessage::Dispatch {
                channel: channel.to_string(),
                data,
            },
            None,
        )
    }

    pub fn is_closed(&self) -> bool {
        *self.link.closed.borrow()
    }

    /// Resolves once the link to the supervisor is lost.
    pub async fn closed(&self) {
        let mut rx = self.link.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

fn env_number(name: &str) -> Result<u64> {
    let value = std::env::var(name)
        .map_err(|_| DroverError::ipc(format!("{} is not set", name)))?;
    value
        .trim()
        .parse()
        .map_err(|_| DroverError::ipc(format!("{} is not a number: {:?}", name, value)))
}

async fn read_loop(channel: Arc<IpcChannel>, link: Arc<Link>) {
    loop {
        match channel.recv().await {
            Ok(Some(packet)) => link.on_packet(packet),
            Ok(None) => {
                debug!("Supervisor closed the channel");
                break;
            }
            Err(e) => {
                warn!("Supervisor channel failed: {}", e);
                break;
            }
        }
    }
    link.close();
}
