//! Replica state machine surface: events in, outputs out.
//!
//! The runtime feeds [`ReplicaEvent`]s to [`ReplicaState::on_event`] from a
//! single executor task and acts on the returned [`ReplicaOutput`]:
//! 1. Send the outbound datagrams through the secure transport
//! 2. Launch the requested slow execution, if any, feeding
//!    [`ReplicaEvent::ExecutionComplete`] back when the delay elapses
//! 3. Stop all tasks when `closing` is set

mod epoch;
mod normal;
mod state;

pub use state::ReplicaState;

use std::time::Instant;

use sievekv_types::{Epoch, Operation, ProcessId, Scope};
use sievekv_wire::Message;

// ============================================================================
// Events
// ============================================================================

/// Events that drive the replica state machine. Every time-sensitive event
/// carries its instant so the machine itself never reads a clock.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A decrypted datagram from peer `from`.
    Inbound {
        from: ProcessId,
        message: Message,
        now: Instant,
    },

    /// A previously requested slow execution ran its course.
    ExecutionComplete { config: Epoch, op: Operation },

    /// Executor heartbeat: admits buffered work (leader) and drives
    /// NEW_SIEVE_CONFIG rounds.
    Tick { now: Instant },

    /// Age-checker heartbeat: scan the operation queue for over-age entries.
    AgeScan { now: Instant },
}

// ============================================================================
// Outputs
// ============================================================================

/// A datagram to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Unicast to one peer.
    To(ProcessId, Message),
    /// Fan-out to every known peer in the scope.
    Broadcast(Scope, Message),
}

/// A request to simulate a long speculative execution. The runtime sleeps the
/// complain threshold in short slices, abandoning the wait when the replica
/// leaves ELABORATION or changes epoch, then feeds back
/// [`ReplicaEvent::ExecutionComplete`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStart {
    pub config: Epoch,
    pub op: Operation,
}

/// Everything a single event produced.
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    /// Datagrams to send, in order.
    pub outbound: Vec<Outbound>,

    /// Slow execution to launch, if the delay draw selected the long path.
    pub execution: Option<ExecutionStart>,

    /// Set exactly once, by CLOSE: stop the runtime.
    pub closing: bool,
}

impl ReplicaOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.execution.is_none() && !self.closing
    }

    pub(crate) fn to(&mut self, pid: ProcessId, message: Message) {
        self.outbound.push(Outbound::To(pid, message));
    }

    pub(crate) fn broadcast(&mut self, scope: Scope, message: Message) {
        self.outbound.push(Outbound::Broadcast(scope, message));
    }
}
