//! Process supervisor.
//!
//! A [`Supervisor`] owns every piece of mutable state: the program table,
//! the live worker records, the socket scheduler, the channel router and the
//! supervisor's own channel registry. It runs as a single task that drains
//! three queues:
//!
//! ```text
//!   SupervisorHandle ──┐
//!   worker watchers  ──┼──► events ───┐
//!   cooldown timers  ──┘              │
//!   accept loops ───────► accepted ───┼──► Supervisor::run ──► Outbox (IpcSender per worker)
//!   query timers ───────► expired ────┘
//! ```
//!
//! Handlers run to completion without awaiting, so no locks are needed.
//! Everything that waits (process exit, packet reads, timers) lives in a
//! separate task that only posts events.

mod events;
mod program;
mod respawn;
mod spawn;

pub use program::ProgramStatus;
pub use respawn::RespawnPolicy;

use crate::channel::{ChannelRegistry, ChannelRouter, Listener, Provider, QueryOrigin};
use crate::config::{ChannelConfig, IpcConfig, SchedulingPolicy, StatePaths};
use crate::error::{DroverError, Result};
use crate::ipc::message::{ChannelMessage, Envelope, SchedulerMessage};
use crate::ipc::protocol::ControlCommand;
use crate::ipc::server::ControlDispatch;
use crate::ipc::transport::{IpcChannel, IpcSender, Packet};
use crate::manifest::{JsonManifestResolver, ManifestResolver, ProgramManifest};
use crate::persist::{PersistedProgram, ProgramStore};
use crate::platform::terminate_process;
use crate::scheduler::{AcceptedConnection, Scheduler, SchedulerKey};
use crate::WorkerId;
use chrono::Utc;
use events::Event;
use program::{Program, WorkerRecord};
use respawn::RespawnDecision;
use serde_json::{json, Value};
use spawn::{spawn_worker, StdioTargets};
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Supervisor construction options.
#[derive(Clone)]
pub struct SupervisorOptions {
    paths: StatePaths,
    policy: SchedulingPolicy,
    respawn: RespawnPolicy,
    query_timeout: Duration,
    resolver: Arc<dyn ManifestResolver>,
}

impl std::fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("paths", &self.paths)
            .field("policy", &self.policy)
            .field("respawn", &self.respawn)
            .field("query_timeout", &self.query_timeout)
            .finish_non_exhaustive()
    }
}

impl SupervisorOptions {
    /// Defaults: policy from `DROVER_SCHED_POLICY`, manifests from
    /// `drover.json`, standard respawn and query windows.
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            policy: SchedulingPolicy::from_env(),
            respawn: RespawnPolicy::default(),
            query_timeout: ChannelConfig::QUERY_TIMEOUT,
            resolver: Arc::new(JsonManifestResolver),
        }
    }

    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_respawn_policy(mut self, respawn: RespawnPolicy) -> Self {
        self.respawn = respawn;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_resolver(mut self, resolver: impl ManifestResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }
}

/// Cloneable front door to a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl SupervisorHandle {
    fn post(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| DroverError::SupervisorGone)
    }

    /// Run a control command.
    pub async fn execute(&self, command: ControlCommand) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Control { command, reply })?;
        rx.await.map_err(|_| DroverError::SupervisorGone)?
    }

    /// Aggregate the supervisor's own provider and every worker of the
    /// program at `dir` for `channel`.
    pub async fn query(&self, dir: impl Into<PathBuf>, channel: impl Into<String>) -> Result<Vec<Value>> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Query {
            dir: dir.into(),
            channel: channel.into(),
            reply,
        })?;
        let results = rx.await.map_err(|_| DroverError::SupervisorGone)??;
        results.await.map_err(|_| DroverError::SupervisorGone)
    }

    /// Broadcast to the supervisor's own listeners and every worker of the
    /// program at `dir`. Returns how many workers it was sent to.
    pub async fn dispatch(
        &self,
        dir: impl Into<PathBuf>,
        channel: impl Into<String>,
        data: Value,
    ) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Dispatch {
            dir: dir.into(),
            channel: channel.into(),
            data,
            reply,
        })?;
        rx.await.map_err(|_| DroverError::SupervisorGone)?
    }

    pub fn register_provider(
        &self,
        channel: impl Into<String>,
        provider: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Result<()> {
        let provider: Provider = Arc::new(provider);
        self.post(Event::RegisterProvider {
            channel: channel.into(),
            provider,
        })
    }

    pub fn register_listener(
        &self,
        channel: impl Into<String>,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<()> {
        let listener: Listener = Arc::new(listener);
        self.post(Event::RegisterListener {
            channel: channel.into(),
            listener,
        })
    }

    /// Stop the loop and terminate every worker, leaving the persisted
    /// table untouched.
    pub fn shutdown(&self) -> Result<()> {
        self.post(Event::Shutdown)
    }
}

#[async_trait::async_trait]
impl ControlDispatch for SupervisorHandle {
    async fn dispatch(&self, command: ControlCommand) -> Result<Value> {
        self.execute(command).await
    }
}

struct Inbox {
    events: mpsc::UnboundedReceiver<Event>,
    accepted: mpsc::UnboundedReceiver<AcceptedConnection>,
    expired: mpsc::UnboundedReceiver<u64>,
}

/// The supervisor and its queues.
pub struct Supervisor {
    state: State,
    inbox: Inbox,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("programs", &self.state.programs.keys().collect::<Vec<_>>())
            .field("workers", &self.state.workers.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Build a supervisor. Must be called inside a tokio runtime.
    pub fn new(options: SupervisorOptions) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let (expired_tx, expired) = mpsc::unbounded_channel();

        let state = State {
            programs: BTreeMap::new(),
            workers: HashMap::new(),
            watchers: HashMap::new(),
            links: HashMap::new(),
            scheduler: Scheduler::new(options.policy, accepted_tx),
            router: ChannelRouter::new(options.query_timeout, expired_tx),
            registry: ChannelRegistry::new(),
            store: ProgramStore::new(options.paths.programs()),
            events_tx,
            next_worker: 0,
            next_instance: 0,
            options,
        };

        Self {
            state,
            inbox: Inbox {
                events,
                accepted,
                expired,
            },
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            events: self.state.events_tx.clone(),
        }
    }

    /// Replay the persisted program table. Entries that fail to start are
    /// logged, skipped and left out of the table saved once the replay is
    /// done. Returns how many programs were started.
    pub fn resume_jobs(&mut self) -> usize {
        let entries = self.state.store.load();
        if entries.is_empty() {
            return 0;
        }
        info!("Resuming {} persisted programs", entries.len());

        let mut resumed = 0;
        for entry in entries {
            let dir = entry.dir.clone();
            match self.state.resume(entry) {
                Ok(_) => resumed += 1,
                Err(e) => warn!("Could not resume {}: {}", dir.display(), e),
            }
        }
        // the table on disk stays whole until every entry has been tried
        self.state.persist();
        resumed
    }

    /// Run until `exit` or [`SupervisorHandle::shutdown`]. Live workers are
    /// terminated and reaped before returning.
    pub async fn run(self) {
        let Supervisor {
            mut state,
            mut inbox,
        } = self;
        info!(
            "Supervisor running (pid {}, {} scheduling)",
            std::process::id(),
            state.scheduler.policy()
        );

        loop {
            tokio::select! {
                Some(event) = inbox.events.recv() => {
                    if state.handle_event(event).is_break() {
                        break;
                    }
                }
                Some(conn) = inbox.accepted.recv() => {
                    state.scheduler.on_accepted(conn, &mut state.links);
                }
                Some(seq) = inbox.expired.recv() => {
                    state.router.expire(seq, &mut state.links);
                }
                else => break,
            }
        }

        state.shutdown().await;
        info!("Supervisor stopped");
    }
}

struct State {
    /// Keyed by directory; presence means "not stopped".
    programs: BTreeMap<PathBuf, Program>,
    workers: HashMap<WorkerId, WorkerRecord>,
    watchers: HashMap<WorkerId, JoinHandle<()>>,
    links: HashMap<WorkerId, IpcSender>,
    scheduler: Scheduler,
    router: ChannelRouter,
    registry: ChannelRegistry,
    store: ProgramStore,
    events_tx: mpsc::UnboundedSender<Event>,
    next_worker: WorkerId,
    next_instance: u64,
    options: SupervisorOptions,
}

impl State {
    fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        debug!("Supervisor event: {:?}", event);
        match event {
            Event::Control { command, reply } => {
                let exiting = command == ControlCommand::Exit;
                let result = self.control(command);
                if let Err(e) = &result {
                    debug!("Control command failed: {}", e);
                }
                let _ = reply.send(result);
                if exiting {
                    return ControlFlow::Break(());
                }
            }
            Event::Message { worker, packet } => self.on_message(worker, packet),
            Event::Exited { worker, status } => self.on_exit(worker, status),
            Event::Rearm {
                dir,
                instance,
                slot,
            } => self.rearm(&dir, instance, slot),
            Event::Query {
                dir,
                channel,
                reply,
            } => {
                let _ = reply.send(self.local_query(&dir, &channel));
            }
            Event::Dispatch {
                dir,
                channel,
                data,
                reply,
            } => {
                let _ = reply.send(self.local_dispatch(&dir, &channel, &data));
            }
            Event::RegisterProvider { channel, provider } => {
                self.registry.register_provider(channel, provider);
            }
            Event::RegisterListener { channel, listener } => {
                self.registry.register_listener(channel, listener);
            }
            Event::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn control(&mut self, command: ControlCommand) -> Result<Value> {
        match command {
            ControlCommand::Start(dir) => self.start(dir),
            ControlCommand::Stop(dir) => self.stop(&dir),
            ControlCommand::Restart(dir) => self.restart(&dir, false),
            ControlCommand::Reload(dir) => self.restart(&dir, true),
            ControlCommand::Status(dirs) => self.status(&dirs),
            ControlCommand::Alive => Ok(json!({ "pid": std::process::id() })),
            ControlCommand::Exit => {
                info!("Exit requested");
                Ok(json!({ "pid": std::process::id() }))
            }
        }
    }

    // ---- lifecycle ----

    fn start(&mut self, dir: PathBuf) -> Result<Value> {
        if self.programs.contains_key(&dir) {
            return Err(DroverError::AlreadyRunning { dir });
        }
        let manifest = self.options.resolver.resolve(&dir)?;
        let reply = self.launch(dir, manifest)?;
        self.persist();
        Ok(reply)
    }

    fn resume(&mut self, entry: PersistedProgram) -> Result<Value> {
        if self.programs.contains_key(&entry.dir) {
            return Err(DroverError::AlreadyRunning { dir: entry.dir });
        }
        let mut manifest = self.options.resolver.resolve(&entry.dir)?;
        manifest.stdout = manifest.stdout.or(entry.stdout);
        manifest.stderr = manifest.stderr.or(entry.stderr);
        self.launch(entry.dir, manifest)
    }

    fn launch(&mut self, dir: PathBuf, manifest: ProgramManifest) -> Result<Value> {
        self.next_instance += 1;
        let program = Program::new(self.next_instance, &dir, manifest);
        let slots = program.slots.len();
        self.programs.insert(dir.clone(), program);

        for index in 0..slots {
            if let Err(e) = self.spawn_slot(&dir, index) {
                error!("Start of {} failed: {}", dir.display(), e);
                if let Some(program) = self.programs.remove(&dir) {
                    terminate_pids(program.slots.iter().filter_map(|slot| slot.pid));
                }
                return Err(e);
            }
        }

        let pids: Vec<Option<u32>> = self.programs[&dir].slots.iter().map(|s| s.pid).collect();
        info!("Started {} with {} workers", dir.display(), slots);
        Ok(json!({ "dir": dir, "workers": slots, "pids": pids }))
    }

    fn stop(&mut self, dir: &Path) -> Result<Value> {
        let program = self
            .programs
            .remove(dir)
            .ok_or_else(|| DroverError::NotRunning {
                dir: dir.to_path_buf(),
            })?;
        self.persist();

        let pids: Vec<u32> = program.slots.iter().filter_map(|slot| slot.pid).collect();
        terminate_pids(pids.iter().copied());
        info!("Stopped {} ({} workers signalled)", dir.display(), pids.len());
        Ok(json!({ "dir": dir, "signalled": pids }))
    }

    fn restart(&mut self, dir: &Path, reload: bool) -> Result<Value> {
        let program = self
            .programs
            .get_mut(dir)
            .ok_or_else(|| DroverError::NotRunning {
                dir: dir.to_path_buf(),
            })?;

        let now = Utc::now();
        program.restarted_at = Some(now);
        if reload {
            program.reloads += 1;
            program.reloaded_at = Some(now);
        }

        let mut pids = Vec::new();
        for slot in program.slots.iter_mut() {
            if let (Some(_), Some(pid)) = (slot.worker, slot.pid) {
                slot.restart_requested = true;
                pids.push(pid);
            }
        }
        terminate_pids(pids.iter().copied());
        info!(
            "{} {} ({} workers signalled)",
            if reload { "Reloading" } else { "Restarting" },
            dir.display(),
            pids.len()
        );
        Ok(json!({ "dir": dir, "signalled": pids }))
    }

    fn status(&self, dirs: &[PathBuf]) -> Result<Value> {
        let statuses: Vec<ProgramStatus> = if dirs.is_empty() {
            self.programs.values().map(Program::status).collect()
        } else {
            dirs.iter()
                .filter_map(|dir| self.programs.get(dir))
                .map(Program::status)
                .collect()
        };
        Ok(serde_json::to_value(statuses)?)
    }

    fn persist(&self) {
        let table: Vec<PersistedProgram> = self.programs.values().map(Program::persisted).collect();
        if let Err(e) = self.store.save(&table) {
            warn!("Could not persist program table: {}", e);
        }
    }

    // ---- workers ----

    fn spawn_slot(&mut self, dir: &Path, index: usize) -> Result<()> {
        let program = self
            .programs
            .get_mut(dir)
            .ok_or_else(|| DroverError::NotRunning {
                dir: dir.to_path_buf(),
            })?;
        let worker = self.next_worker + 1;
        let stdio = StdioTargets {
            stdout: program.manifest.stdout.as_deref(),
            stderr: program.manifest.stderr.as_deref(),
        };
        let spawned = spawn_worker(dir, &program.manifest, worker, index, stdio)?;
        self.next_worker = worker;

        let instance = program.instance;
        if let Some(slot) = program.slots.get_mut(index) {
            slot.worker = Some(worker);
            slot.pid = Some(spawned.pid);
        }

        let channel = Arc::new(spawned.channel);
        let (sender, _writer) = IpcSender::spawn(Arc::clone(&channel));
        self.links.insert(worker, sender);
        let watcher = tokio::spawn(watch_worker(
            worker,
            channel,
            spawned.child,
            self.events_tx.clone(),
        ));
        self.watchers.insert(worker, watcher);
        self.workers.insert(
            worker,
            WorkerRecord {
                dir: dir.to_path_buf(),
                instance,
                slot: index,
                pid: spawned.pid,
            },
        );
        Ok(())
    }

    fn on_exit(&mut self, worker: WorkerId, status: Option<std::process::ExitStatus>) {
        self.links.remove(&worker);
        self.watchers.remove(&worker);
        let Some(record) = self.workers.remove(&worker) else {
            return;
        };
        self.scheduler.remove_worker(worker, &mut self.links);
        self.router.forget_worker(worker, &mut self.links);

        let policy = self.options.respawn;
        let Some(program) = self.programs.get_mut(&record.dir) else {
            debug!("Worker {} (PID {}) of a stopped program exited", worker, record.pid);
            return;
        };
        if program.instance != record.instance {
            return;
        }
        let Some(slot) = program.slots.get_mut(record.slot) else {
            return;
        };
        if slot.worker != Some(worker) {
            return;
        }
        slot.worker = None;
        slot.pid = None;

        let decision = if std::mem::take(&mut slot.restart_requested) {
            RespawnDecision::Respawn
        } else {
            info!(
                "Worker {} (PID {}) of {} exited: {}",
                worker,
                record.pid,
                record.dir.display(),
                status.map_or_else(|| "unknown status".to_string(), |s| s.to_string())
            );
            slot.tracker.on_exit(Instant::now(), &policy)
        };

        match decision {
            RespawnDecision::Respawn => self.respawn(&record.dir, record.instance, record.slot),
            RespawnDecision::Disable => {
                warn!(
                    "{} slot {} is respawning too fast; disabled for {:?}",
                    record.dir.display(),
                    record.slot,
                    policy.cooldown
                );
                self.disable(&record.dir, record.instance, record.slot);
            }
        }
    }

    fn disable(&self, dir: &Path, instance: u64, slot: usize) {
        let tx = self.events_tx.clone();
        let cooldown = self.options.respawn.cooldown;
        let dir = dir.to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let _ = tx.send(Event::Rearm {
                dir,
                instance,
                slot,
            });
        });
    }

    fn rearm(&mut self, dir: &Path, instance: u64, index: usize) {
        let Some(program) = self.programs.get_mut(dir) else {
            return;
        };
        if program.instance != instance {
            return;
        }
        let Some(slot) = program.slots.get_mut(index) else {
            return;
        };
        if slot.worker.is_some() {
            return;
        }
        slot.tracker.reset();
        info!("Re-enabling {} slot {}", dir.display(), index);
        self.respawn(dir, instance, index);
    }

    /// Replace the worker of a slot; a failed spawn disables the slot.
    fn respawn(&mut self, dir: &Path, instance: u64, index: usize) {
        match self.spawn_slot(dir, index) {
            Ok(()) => {
                if let Some(slot) = self.programs.get_mut(dir).and_then(|p| p.slots.get_mut(index)) {
                    slot.restarts += 1;
                }
            }
            Err(e) => {
                warn!("Respawn of {} slot {} failed: {}", dir.display(), index, e);
                self.disable(dir, instance, index);
            }
        }
    }

    /// Live workers of the program `worker` belongs to, excluding it.
    fn siblings(&self, worker: WorkerId) -> Vec<WorkerId> {
        self.workers
            .get(&worker)
            .and_then(|record| self.programs.get(&record.dir))
            .map(|program| {
                program
                    .workers()
                    .into_iter()
                    .filter(|&w| w != worker)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- worker messages ----

    fn on_message(&mut self, worker: WorkerId, packet: Packet) {
        if !self.workers.contains_key(&worker) {
            return;
        }
        match packet.envelope {
            Envelope::Scheduler(message) => self.on_scheduler_message(worker, message, packet.fd),
            Envelope::Channel(message) => {
                if packet.fd.is_some() {
                    debug!("Dropping descriptor sent by worker {} with a channel message", worker);
                }
                self.on_channel_message(worker, message);
            }
        }
    }

    fn on_scheduler_message(
        &mut self,
        worker: WorkerId,
        message: SchedulerMessage,
        fd: Option<std::os::fd::OwnedFd>,
    ) {
        if fd.is_some() {
            debug!("Dropping descriptor sent by worker {}", worker);
        }
        match message {
            SchedulerMessage::QueryServer {
                seq,
                address,
                port,
                address_type,
                fd,
            } => {
                let key = SchedulerKey {
                    address,
                    port,
                    address_type,
                    fd,
                };
                self.scheduler
                    .query_server(worker, seq, key, &mut self.links);
            }
            SchedulerMessage::HandoffAck { key, ack, accepted } => {
                self.scheduler
                    .handoff_ack(worker, &key, ack, accepted, &mut self.links);
            }
            SchedulerMessage::Close { key } => {
                self.scheduler.release(worker, &key, &mut self.links);
            }
            SchedulerMessage::ServerAck { .. } | SchedulerMessage::NewConn { .. } => {
                debug!("Ignoring supervisor-bound scheduler message from worker {}", worker);
            }
        }
    }

    fn on_channel_message(&mut self, worker: WorkerId, message: ChannelMessage) {
        match message {
            ChannelMessage::Query { channel, seq } => {
                let siblings = self.siblings(worker);
                self.router.query(
                    QueryOrigin::Worker { worker, seq },
                    &channel,
                    Vec::new(),
                    &siblings,
                    &mut self.links,
                );
            }
            ChannelMessage::Dispatch { channel, data } => {
                let siblings = self.siblings(worker);
                self.router
                    .dispatch(&channel, &data, &siblings, &mut self.links);
            }
            ChannelMessage::Queryback {
                ack,
                status,
                result,
                ..
            } => {
                self.router
                    .queryback(worker, ack, status, result, &mut self.links);
            }
        }
    }

    // ---- supervisor-side channel access ----

    fn local_query(&mut self, dir: &Path, channel: &str) -> Result<oneshot::Receiver<Vec<Value>>> {
        let workers = self
            .programs
            .get(dir)
            .map(Program::workers)
            .ok_or_else(|| DroverError::NotRunning {
                dir: dir.to_path_buf(),
            })?;
        let (tx, rx) = oneshot::channel();
        let initial = self.registry.answer(channel).into_iter().collect();
        self.router.query(
            QueryOrigin::Local(tx),
            channel,
            initial,
            &workers,
            &mut self.links,
        );
        Ok(rx)
    }

    fn local_dispatch(&mut self, dir: &Path, channel: &str, data: &Value) -> Result<usize> {
        let workers = self
            .programs
            .get(dir)
            .map(Program::workers)
            .ok_or_else(|| DroverError::NotRunning {
                dir: dir.to_path_buf(),
            })?;
        self.registry.dispatch(channel, data);
        Ok(self
            .router
            .dispatch(channel, data, &workers, &mut self.links))
    }

    async fn shutdown(&mut self) {
        let pids: Vec<u32> = self.workers.values().map(|record| record.pid).collect();
        info!("Terminating {} workers", pids.len());
        terminate_pids(pids.into_iter());

        self.links.clear();
        let watchers: Vec<JoinHandle<()>> = self.watchers.drain().map(|(_, w)| w).collect();
        let reaped = tokio::time::timeout(
            IpcConfig::DRAIN_TIMEOUT,
            futures::future::join_all(watchers),
        )
        .await;
        if reaped.is_err() {
            warn!("Some workers did not exit within {:?}", IpcConfig::DRAIN_TIMEOUT);
        }
    }
}

fn terminate_pids(pids: impl Iterator<Item = u32>) {
    for pid in pids {
        if let Err(e) = terminate_process(pid) {
            warn!("Could not signal PID {}: {}", pid, e);
        }
    }
}

/// Forward a worker's packets and report its exit.
async fn watch_worker(
    worker: WorkerId,
    channel: Arc<IpcChannel>,
    mut child: Child,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut reading = true;
    loop {
        tokio::select! {
            packet = channel.recv(), if reading => match packet {
                Ok(Some(packet)) => {
                    let _ = events.send(Event::Message { worker, packet });
                }
                Ok(None) => reading = false,
                Err(e) => {
                    debug!("Channel to worker {} failed: {}", worker, e);
                    reading = false;
                }
            },
            status = child.wait() => {
                let status = match status {
                    Ok(status) => Some(status),
                    Err(e) => {
                        warn!("Could not wait for worker {}: {}", worker, e);
                        None
                    }
                };
                let _ = events.send(Event::Exited { worker, status });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::StaticManifestResolver;
    use tempfile::TempDir;

    struct Harness {
        _state: TempDir,
        program: TempDir,
        paths: StatePaths,
        handle: SupervisorHandle,
        task: JoinHandle<()>,
    }

    fn harness(manifest: ProgramManifest, respawn: RespawnPolicy) -> Harness {
        let state = TempDir::new().unwrap();
        let program = TempDir::new().unwrap();
        let paths = StatePaths::new(state.path());
        let options = SupervisorOptions::new(paths.clone())
            .with_resolver(StaticManifestResolver::new(manifest))
            .with_respawn_policy(respawn);
        let supervisor = Supervisor::new(options);
        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());
        Harness {
            _state: state,
            program,
            paths,
            handle,
            task,
        }
    }

    fn sleeper(workers: usize) -> ProgramManifest {
        ProgramManifest::new("/bin/sleep")
            .with_args(["30"])
            .with_workers(workers)
    }

    async fn status_of(handle: &SupervisorHandle, dir: &Path) -> Option<ProgramStatus> {
        let value = handle
            .execute(ControlCommand::Status(vec![dir.to_path_buf()]))
            .await
            .unwrap();
        let mut statuses: Vec<ProgramStatus> = serde_json::from_value(value).unwrap();
        statuses.pop()
    }

    async fn wait_for<F>(handle: &SupervisorHandle, dir: &Path, mut done: F) -> ProgramStatus
    where
        F: FnMut(&ProgramStatus) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = status_of(handle, dir).await {
                if done(&status) {
                    return status;
                }
            }
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_start_spawns_every_slot() {
        let h = harness(sleeper(3), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();

        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();
        let status = status_of(&h.handle, &dir).await.unwrap();
        assert_eq!(status.workers, 3);
        assert_eq!(status.alive, 3);
        assert!(status.pids.iter().all(Option::is_some));
        assert_eq!(status.restarts, vec![0, 0, 0]);

        let err = h
            .handle
            .execute(ControlCommand::Start(dir.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::AlreadyRunning { .. }));

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_killed_worker_respawns_once() {
        let h = harness(sleeper(2), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();
        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();

        let before = status_of(&h.handle, &dir).await.unwrap();
        let victim = before.pids[0].unwrap();
        terminate_process(victim).unwrap();

        let after = wait_for(&h.handle, &dir, |s| {
            s.restarts[0] == 1 && s.pids[0].is_some()
        })
        .await;
        assert_ne!(after.pids[0], Some(victim));
        assert_eq!(after.pids[1], before.pids[1]);
        assert_eq!(after.restarts, vec![1, 0]);

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_loop_disables_slot() {
        let h = harness(ProgramManifest::new("/bin/true"), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();
        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();

        let status = wait_for(&h.handle, &dir, |s| s.restarts[0] == 2 && s.alive == 0).await;
        assert_eq!(status.pids, vec![None]);

        // still disabled well inside the cooldown
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = status_of(&h.handle, &dir).await.unwrap();
        assert_eq!(status.restarts, vec![2]);
        assert_eq!(status.alive, 0);

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_killing_healthy_worker_three_times_disables_slot() {
        let respawn = RespawnPolicy::default()
            .with_window(Duration::from_millis(1000))
            .with_cooldown(Duration::from_millis(1500));
        let h = harness(sleeper(1), respawn);
        let dir = h.program.path().to_path_buf();
        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();

        // outlive the window before the first kill
        tokio::time::sleep(Duration::from_millis(1200)).await;

        for restarts in 1..=2 {
            let victim = status_of(&h.handle, &dir).await.unwrap().pids[0].unwrap();
            terminate_process(victim).unwrap();
            wait_for(&h.handle, &dir, |s| {
                s.restarts[0] == restarts && s.pids[0].is_some_and(|pid| pid != victim)
            })
            .await;
        }

        let victim = status_of(&h.handle, &dir).await.unwrap().pids[0].unwrap();
        terminate_process(victim).unwrap();
        let status = wait_for(&h.handle, &dir, |s| s.pids[0].is_none()).await;
        assert_eq!(status.restarts, vec![2]);

        // no fourth spawn inside the cooldown
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = status_of(&h.handle, &dir).await.unwrap();
        assert_eq!(status.pids, vec![None]);
        assert_eq!(status.restarts, vec![2]);

        let status = wait_for(&h.handle, &dir, |s| s.alive == 1).await;
        assert_eq!(status.restarts, vec![3]);

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_slot_comes_back_after_cooldown() {
        let respawn = RespawnPolicy::default().with_cooldown(Duration::from_millis(200));
        let h = harness(ProgramManifest::new("/bin/true"), respawn);
        let dir = h.program.path().to_path_buf();
        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();

        wait_for(&h.handle, &dir, |s| s.restarts[0] >= 3).await;

        h.handle.execute(ControlCommand::Stop(dir)).await.unwrap();
        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_removes_program() {
        let h = harness(sleeper(2), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();
        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();

        let reply = h.handle.execute(ControlCommand::Stop(dir.clone())).await.unwrap();
        assert_eq!(reply["signalled"].as_array().map(Vec::len), Some(2));
        assert!(status_of(&h.handle, &dir).await.is_none());

        // no respawn for the former workers
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(status_of(&h.handle, &dir).await.is_none());

        let err = h
            .handle
            .execute(ControlCommand::Stop(dir.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::NotRunning { .. }));

        let persisted = ProgramStore::new(h.paths.programs()).read().unwrap();
        assert_eq!(persisted, Some(vec![]));

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_replaces_workers() {
        let h = harness(sleeper(2), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();
        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();
        let before = status_of(&h.handle, &dir).await.unwrap();

        h.handle.execute(ControlCommand::Reload(dir.clone())).await.unwrap();
        let after = wait_for(&h.handle, &dir, |s| s.restarts == vec![1, 1] && s.alive == 2).await;

        assert_eq!(after.reloads, 1);
        assert!(after.reloaded_at.is_some());
        assert!(after.restarted_at.is_some());
        assert!(after.pids.iter().zip(&before.pids).all(|(a, b)| a != b));

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_program_errors() {
        let h = harness(sleeper(1), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();

        for command in [
            ControlCommand::Stop(dir.clone()),
            ControlCommand::Restart(dir.clone()),
            ControlCommand::Reload(dir.clone()),
        ] {
            let err = h.handle.execute(command).await.unwrap_err();
            assert_eq!(err.status_code(), 404);
        }
        let value = h
            .handle
            .execute(ControlCommand::Status(vec![dir.clone()]))
            .await
            .unwrap();
        assert_eq!(value, json!([]));

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_leaves_nothing_behind() {
        let h = harness(ProgramManifest::new("/nonexistent/worker"), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();

        let err = h
            .handle
            .execute(ControlCommand::Start(dir.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::SpawnFailed { .. }));
        assert!(status_of(&h.handle, &dir).await.is_none());

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_jobs_replays_table() {
        let state = TempDir::new().unwrap();
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let paths = StatePaths::new(state.path());
        ProgramStore::new(paths.programs())
            .save(&[
                PersistedProgram {
                    dir: first.path().to_path_buf(),
                    stdout: None,
                    stderr: None,
                },
                PersistedProgram {
                    dir: second.path().to_path_buf(),
                    stdout: None,
                    stderr: None,
                },
            ])
            .unwrap();

        let options = SupervisorOptions::new(paths)
            .with_resolver(StaticManifestResolver::new(sleeper(1)));
        let mut supervisor = Supervisor::new(options);
        assert_eq!(supervisor.resume_jobs(), 2);

        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());
        let value = handle.execute(ControlCommand::Status(vec![])).await.unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));

        handle.execute(ControlCommand::Exit).await.unwrap();
        task.await.unwrap();
    }

    /// Reports how many entries the table on disk holds each time a
    /// program is resolved.
    struct TableWatcher {
        store: ProgramStore,
        seen: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    impl ManifestResolver for TableWatcher {
        fn resolve(&self, dir: &Path) -> Result<ProgramManifest> {
            let entries = self.store.read()?.map_or(0, |table| table.len());
            self.seen.lock().unwrap().push(entries);
            if dir.join("broken").exists() {
                return Err(DroverError::Manifest {
                    dir: dir.to_path_buf(),
                    message: "broken".to_string(),
                });
            }
            sleeper(1).resolve_in(dir)
        }
    }

    #[tokio::test]
    async fn test_resume_saves_table_once_after_replay() {
        let state = TempDir::new().unwrap();
        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
        std::fs::write(dirs[1].path().join("broken"), "").unwrap();
        let paths = StatePaths::new(state.path());
        let store = ProgramStore::new(paths.programs());
        let table: Vec<PersistedProgram> = dirs
            .iter()
            .map(|dir| PersistedProgram {
                dir: dir.path().to_path_buf(),
                stdout: None,
                stderr: None,
            })
            .collect();
        store.save(&table).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let options = SupervisorOptions::new(paths.clone()).with_resolver(TableWatcher {
            store: ProgramStore::new(paths.programs()),
            seen: Arc::clone(&seen),
        });
        let mut supervisor = Supervisor::new(options);
        assert_eq!(supervisor.resume_jobs(), 2);

        // every entry was still on disk while the replay ran
        assert_eq!(*seen.lock().unwrap(), vec![3, 3, 3]);
        let saved = store.read().unwrap().unwrap();
        let mut saved_dirs: Vec<&Path> = saved.iter().map(|entry| entry.dir.as_path()).collect();
        let mut expected = vec![dirs[0].path(), dirs[2].path()];
        saved_dirs.sort();
        expected.sort();
        assert_eq!(saved_dirs, expected);

        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());
        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_table_resumes_nothing() {
        let state = TempDir::new().unwrap();
        let paths = StatePaths::new(state.path());
        std::fs::write(paths.programs(), "{ not json").unwrap();

        let options = SupervisorOptions::new(paths)
            .with_resolver(StaticManifestResolver::new(sleeper(1)));
        let mut supervisor = Supervisor::new(options);
        assert_eq!(supervisor.resume_jobs(), 0);
    }

    #[tokio::test]
    async fn test_exit_keeps_persisted_table() {
        let h = harness(sleeper(1), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();
        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();

        let reply = h.handle.execute(ControlCommand::Exit).await.unwrap();
        assert_eq!(reply["pid"], json!(std::process::id()));
        h.task.await.unwrap();

        let persisted = ProgramStore::new(h.paths.programs()).load();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].dir, dir);

        let err = h.handle.execute(ControlCommand::Alive).await.unwrap_err();
        assert!(matches!(err, DroverError::SupervisorGone));
    }

    #[tokio::test]
    async fn test_local_channel_access_without_workers() {
        let h = harness(sleeper(1), RespawnPolicy::default());
        let dir = h.program.path().to_path_buf();

        let err = h.handle.query(dir.clone(), "value").await.unwrap_err();
        assert!(matches!(err, DroverError::NotRunning { .. }));

        h.handle.register_provider("value", || json!("supervisor")).unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        h.handle
            .register_listener("news", move |data: &Value| {
                let _ = seen_tx.send(data.clone());
            })
            .unwrap();

        h.handle.execute(ControlCommand::Start(dir.clone())).await.unwrap();

        // sleep never answers; the window closes with only the local answer
        let results = h.handle.query(dir.clone(), "value").await.unwrap();
        assert_eq!(results, vec![json!("supervisor")]);

        let delivered = h.handle.dispatch(dir.clone(), "news", json!(1)).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(seen_rx.recv().await, Some(json!(1)));

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
    }
}
