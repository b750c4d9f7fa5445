//! Events consumed by the supervisor loop.

use crate::channel::{Listener, Provider};
use crate::error::Result;
use crate::ipc::protocol::ControlCommand;
use crate::ipc::transport::Packet;
use crate::WorkerId;
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::sync::oneshot;

pub(crate) enum Event {
    /// A request from the control endpoint.
    Control {
        command: ControlCommand,
        reply: oneshot::Sender<Result<Value>>,
    },
    /// A packet read from a worker's channel.
    Message { worker: WorkerId, packet: Packet },
    /// A worker process has exited. `status` is `None` when waiting failed.
    Exited {
        worker: WorkerId,
        status: Option<ExitStatus>,
    },
    /// The cooldown for a disabled slot has elapsed.
    Rearm {
        dir: PathBuf,
        instance: u64,
        slot: usize,
    },
    /// A query issued through the handle. The reply carries the receiver
    /// for the aggregate.
    Query {
        dir: PathBuf,
        channel: String,
        reply: oneshot::Sender<Result<oneshot::Receiver<Vec<Value>>>>,
    },
    Dispatch {
        dir: PathBuf,
        channel: String,
        data: Value,
        reply: oneshot::Sender<Result<usize>>,
    },
    RegisterProvider {
        channel: String,
        provider: Provider,
    },
    RegisterListener {
        channel: String,
        listener: Listener,
    },
    Shutdown,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Control { command, .. } => write!(f, "Control({:?})", command),
            Event::Message { worker, packet } => {
                write!(f, "Message({}, {:?})", worker, packet.envelope)
            }
            Event::Exited { worker, status } => write!(f, "Exited({}, {:?})", worker, status),
            Event::Rearm {
                dir,
                instance,
                slot,
            } => write!(f, "Rearm({}#{}, slot {})", dir.display(), instance, slot),
            Event::Query { dir, channel, .. } => {
                write!(f, "Query({}, {})", dir.display(), channel)
            }
            Event::Dispatch { dir, channel, .. } => {
                write!(f, "Dispatch({}, {})", dir.display(), channel)
            }
            Event::RegisterProvider { channel, .. } => write!(f, "RegisterProvider({})", channel),
            Event::RegisterListener { channel, .. } => write!(f, "RegisterListener({})", channel),
            Event::Shutdown => f.write_str("Shutdown"),
        }
    }
}
