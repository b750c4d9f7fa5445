//! Inter-process communication.
//!
//! # Architecture
//!
//! - **Transport**: `SOCK_SEQPACKET` channel between the supervisor and each
//!   worker, carrying one JSON message and optionally one descriptor per packet
//! - **Message**: tagged scheduler and channel protocol types
//! - **Protocol**: control endpoint framing and request/response types
//! - **Server / Client**: the control endpoint on a Unix socket

pub mod client;
pub mod message;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ControlClient, LaunchSpec};
pub use message::{
    AddressType, ChannelMessage, ChannelStatus, Envelope, SchedulerMessage, ServerInfo,
};
pub use protocol::{ControlAction, ControlCommand, ControlRequest, ControlResponse};
pub use server::{ControlDispatch, ControlServer, ControlServerHandle};
pub use transport::{IpcChannel, IpcSender, Outbox, Packet};
