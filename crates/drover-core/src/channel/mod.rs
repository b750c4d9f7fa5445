//! Channel bus.
//!
//! Named channels carry two kinds of traffic between the workers of one
//! program:
//!
//! - **query**: every process with a provider for the channel contributes
//!   its current answer; the caller gets the aggregate within
//!   `ChannelConfig::QUERY_TIMEOUT`
//! - **dispatch**: fire-and-forget broadcast to every listener
//!
//! Workers never talk to each other directly. The supervisor's
//! [`ChannelRouter`] fans traffic out to siblings and routes answers back.
//! The worker side lives in [`crate::worker`].

pub mod registry;
pub mod router;

pub use registry::{ChannelRegistry, Listener, Provider};
pub use router::{ChannelRouter, QueryOrigin};
