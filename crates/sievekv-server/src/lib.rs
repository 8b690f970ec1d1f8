//! Sieve replica daemon.
//!
//! Wires the pure state machine (`sievekv-rsm`) to the encrypted datagram
//! transport (`sievekv-transport`) with the listener / executor / age-checker
//! task split. See [`Replica::spawn`].

mod inbox;
mod runtime;

pub use inbox::{Inbox, PushResult};
pub use runtime::{Replica, RuntimeConfig, ServerError};
