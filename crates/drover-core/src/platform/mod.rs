//! Platform abstraction layer.
//!
//! All OS-specific process and descriptor handling lives here rather than
//! being scattered through the supervisor.
//!
//! # Architecture
//!
//! - `process` - signalling and liveness checks for worker processes
//! - `fd` - descriptor inheritance and adoption across `exec`
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support (`SOCK_SEQPACKET` socket pairs, `MSG_CMSG_CLOEXEC`)

pub mod fd;
pub mod process;

pub use fd::{duplicate_fd, set_inheritable, set_nonblocking};
pub use process::{is_process_alive, signal_process, terminate_process};

