//! Drover Core - local process supervisor.
//!
//! Starts, stops, restarts and reloads "programs" (a directory plus a
//! manifest), each running as a fixed number of worker processes, and gives
//! those workers two things they cannot do alone:
//!
//! - share one listening endpoint, either by holding duplicates of the same
//!   socket or by receiving connections one at a time from the supervisor
//!   ([`scheduler`])
//! - query and broadcast to their siblings without a shared store
//!   ([`channel`])
//!
//! The supervisor side lives in [`supervisor`]; code running inside a
//! worker uses [`worker::WorkerRuntime`].
//!
//! # Example
//!
//! ```rust,ignore
//! use drover_core::{ControlServer, StatePaths, Supervisor, SupervisorOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> drover_core::Result<()> {
//!     let paths = StatePaths::default_location()?;
//!     let mut supervisor = Supervisor::new(SupervisorOptions::new(paths.clone()));
//!     supervisor.resume_jobs();
//!
//!     let handle = supervisor.handle();
//!     let server = ControlServer::start(paths.socket(), Arc::new(handle)).await?;
//!     supervisor.run().await;
//!     server.drain().await;
//!     Ok(())
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("drover-core requires Linux (SOCK_SEQPACKET channels and MSG_CMSG_CLOEXEC)");

pub mod channel;
pub mod config;
pub mod error;
pub mod ipc;
pub mod manifest;
pub mod persist;
pub mod platform;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod testing;

/// Supervisor-assigned worker identity, unique for the supervisor's
/// lifetime.
pub type WorkerId = u64;

pub use config::{SchedulingPolicy, StatePaths};
pub use error::{DroverError, Result};
pub use ipc::{AddressType, ControlClient, ControlCommand, ControlResponse, ControlServer, LaunchSpec};
pub use manifest::{JsonManifestResolver, ManifestResolver, ProgramManifest, StaticManifestResolver};
pub use persist::{PersistedProgram, ProgramStore};
pub use supervisor::{ProgramStatus, RespawnPolicy, Supervisor, SupervisorHandle, SupervisorOptions};
pub use worker::{SharedListener, SharedStream, WorkerRuntime};
