//! Sieve replica state machine.
//!
//! This crate implements the per-replica Sieve protocol engine as a pure,
//! deterministic state machine:
//! - Takes messages and timer events as input
//! - Produces new state, outgoing datagrams and execution requests as output
//! - No sockets, no sleeping, no ambient clock (events carry their instant)
//!
//! The runtime (`sievekv-server`) owns all I/O and feeds this machine from a
//! single executor task, so protocol state has exactly one writer.
//!
//! # Protocol overview
//!
//! ```text
//! Client ──CLIENT_INVOKE──► Replica ──INVOKE──► Leader (buffers FIFO)
//!
//! Leader ──EXECUTE──► All          (one operation at a time)
//! All    ──APPROVE──► Leader       (digest of speculative response)
//! Leader ──ORDER────► All          (CONFIRM + correct group, or ABORT + tally)
//! All    ──VALIDATION──► Leader
//! Leader ──COMMIT / ABORT──► All, terminal output ──► Client
//! ```
//!
//! Liveness: operations aging past [`OP_MAX_AGE`] raise COMPLAIN; a complained
//! or disagreed round drives NEW_SIEVE_CONFIG (random next leader, installed
//! once more than `2f` announcements agree).

pub mod queue;
pub mod quorum;
mod replica;


pub use queue::OpQueue;
pub use replica::{ExecutionStart, Outbound, ReplicaEvent, ReplicaOutput, ReplicaState};

use std::time::Duration;

/// Age past which an invoked-but-unordered operation triggers COMPLAIN or
/// OPERATION_NOT_QUEUED.
pub const OP_MAX_AGE: Duration = Duration::from_secs(4);

/// How long the artificial slow-execution path runs. Longer than
/// [`OP_MAX_AGE`] so a slow leader reliably draws complaints.
pub const COMPLAIN_THRESHOLD: Duration = Duration::from_secs(7);

/// How long a NEW_SIEVE_CONFIG round may run before it is restarted with a
/// fresh leader pick.
pub const NEW_SIEVE_CONFIG_THRESHOLD: Duration = Duration::from_secs(3);

/// Protocol timers, all local to one replica's wall clock. The defaults are
/// the production values; tests compress them.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// See [`OP_MAX_AGE`].
    pub op_max_age: Duration,
    /// See [`COMPLAIN_THRESHOLD`].
    pub complain_threshold: Duration,
    /// See [`NEW_SIEVE_CONFIG_THRESHOLD`].
    pub new_config_threshold: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            op_max_age: OP_MAX_AGE,
            complain_threshold: COMPLAIN_THRESHOLD,
            new_config_threshold: NEW_SIEVE_CONFIG_THRESHOLD,
        }
    }
}

impl Timing {
    /// Uniformly scaled timers, for tests that must not wait out the
    /// production thresholds.
    #[must_use]
    pub fn scaled_down(factor: u32) -> Self {
        let d = Self::default();
        Self {
            op_max_age: d.op_max_age / factor,
            complain_threshold: d.complain_threshold / factor,
            new_config_threshold: d.new_config_threshold / factor,
        }
    }
}
