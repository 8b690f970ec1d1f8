//! Replica state structure and event dispatch.

use std::collections::HashMap;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use sievekv_crypto::sign_response;
use sievekv_types::{Dictionary, Epoch, Operation, Phase, ProcessId, Scalar, Scope};
use sievekv_wire::{DelayProfile, LeaderBuffer, Message, MessageKind};

use crate::quorum::Tally;
use crate::{OpQueue, Timing};

use super::{ExecutionStart, ReplicaEvent, ReplicaOutput};

/// The initial leader at epoch zero.
pub(crate) const INITIAL_LEADER: ProcessId = ProcessId::new(1);

/// The state of one Sieve replica.
///
/// All fields are plain data; the struct is cloneable so tests can snapshot
/// and diff states across events. Mutation happens only inside
/// [`ReplicaState::on_event`].
#[derive(Debug, Clone)]
pub struct ReplicaState {
    // ========================================================================
    // Identity and knobs
    // ========================================================================
    pub(crate) pid: ProcessId,
    pub(crate) n: usize,
    pub(crate) f: usize,
    pub(crate) timing: Timing,

    /// Nonzero simulates a faulty replica: speculative responses are mangled
    /// before digesting.
    pub(crate) faulty: u64,

    /// Execution delay draw parameters (debug-settable).
    pub(crate) ex_time: DelayProfile,

    // ========================================================================
    // Epoch state
    // ========================================================================
    pub(crate) config: Epoch,
    pub(crate) leader: ProcessId,
    pub(crate) next_epoch: Option<Epoch>,
    pub(crate) next_leader: Option<ProcessId>,

    /// When the current NEW_SIEVE_CONFIG round started, for the restart timer.
    pub(crate) round_started: Option<Instant>,

    // ========================================================================
    // Operation state
    // ========================================================================
    /// Protocol phase `s`.
    pub(crate) phase: Phase,

    /// Speculative phase `t`.
    pub(crate) spec_phase: Option<Phase>,

    /// Invoked, not-yet-committed operations (`I`).
    pub(crate) invoked: OpQueue,

    /// Leader's buffer `B`: one slot per submitter.
    pub(crate) buffer: HashMap<ProcessId, Operation>,

    /// FIFO admission order into `B`.
    pub(crate) buffer_queue: Vec<ProcessId>,

    /// Operation currently being ordered, and who submitted it.
    pub(crate) cur: Option<Operation>,
    pub(crate) cur_pid: Option<ProcessId>,

    /// Speculative response `r`.
    pub(crate) response: Option<Operation>,

    /// APPROVE / VALIDATION / NEW_SIEVE_CONFIG collection, keyed by sender.
    pub(crate) msg_buffer: Tally,

    /// The ORDER this replica is validating.
    pub(crate) last_order: Option<Message>,

    /// Operation → originating client.
    pub(crate) clients: HashMap<Operation, ProcessId>,

    /// The committed dictionary.
    pub(crate) dictionary: Dictionary,

    pub(crate) rng: SmallRng,
}

impl ReplicaState {
    /// Creates a replica at epoch zero with process 1 as leader.
    pub fn new(pid: ProcessId, n: usize, faulty: u64, timing: Timing) -> Self {
        Self::with_seed(pid, n, faulty, timing, rand::random())
    }

    /// Like [`ReplicaState::new`] with a fixed rng seed, for deterministic
    /// tests.
    pub fn with_seed(pid: ProcessId, n: usize, faulty: u64, timing: Timing, seed: u64) -> Self {
        Self {
            pid,
            n,
            f: sievekv_types::fault_bound(n),
            timing,
            faulty,
            ex_time: DelayProfile(1, 100, 20),
            config: Epoch::ZERO,
            leader: INITIAL_LEADER,
            next_epoch: None,
            next_leader: None,
            round_started: None,
            phase: Phase::S0,
            spec_phase: None,
            invoked: OpQueue::new(),
            buffer: HashMap::new(),
            buffer_queue: Vec::new(),
            cur: None,
            cur_pid: None,
            response: None,
            msg_buffer: Tally::new(),
            last_order: None,
            clients: HashMap::new(),
            dictionary: Dictionary::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn config(&self) -> Epoch {
        self.config
    }

    pub fn leader(&self) -> ProcessId {
        self.leader
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_leader(&self) -> bool {
        self.leader == self.pid
    }

    /// Local read of a committed value. Stale reads are allowed by design;
    /// there is no quorum read.
    pub fn lookup(&self, key: &Scalar) -> Option<&Scalar> {
        self.dictionary.get(key)
    }

    /// The whole committed dictionary, for inspection.
    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    /// Advances the state machine by one event.
    pub fn on_event(mut self, event: ReplicaEvent) -> (Self, ReplicaOutput) {
        let mut out = ReplicaOutput::empty();
        match event {
            ReplicaEvent::Inbound { from, message, now } => {
                self.route(from, message, now, &mut out);
            }
            ReplicaEvent::ExecutionComplete { config, op } => {
                self.on_execution_complete(config, &op, &mut out);
            }
            ReplicaEvent::Tick { now } => {
                self.on_tick(now, &mut out);
            }
            ReplicaEvent::AgeScan { now } => {
                self.on_age_scan(now, &mut out);
            }
        }
        (self, out)
    }

    fn route(&mut self, from: ProcessId, message: Message, now: Instant, out: &mut ReplicaOutput) {
        match message.kind {
            MessageKind::ClientInvoke => self.on_client_invoke(message, from, now, out),
            MessageKind::Invoke => self.on_invoke(message, from),
            MessageKind::Execute => self.on_execute(message, out),
            MessageKind::Approve => {
                // Only the leader tallies, and only while it is waiting for
                // approvals; anything else is a stray reply.
                if self.is_leader() && self.phase == Phase::WaitingApproval {
                    self.on_approve(message, from, out);
                }
            }
            MessageKind::Complain => self.on_complain(&message, out),
            MessageKind::NewSieveConfig => self.on_new_sieve_config(message, from, now, out),
            MessageKind::Order => self.on_order(message, out),
            MessageKind::Validation => {
                if self.phase == Phase::WaitingValidation {
                    self.on_validation(message, from, out);
                }
            }
            MessageKind::Commit => self.on_commit_broadcast(),
            MessageKind::Abort => self.on_abort_broadcast(&message),
            MessageKind::RequestValue => self.on_request_value(&message, from, out),
            MessageKind::Debug => self.on_debug(&message),
            MessageKind::Close => {
                tracing::info!(replica = %self.pid, "received CLOSE, shutting down");
                self.phase = Phase::Closing;
                out.closing = true;
            }
            MessageKind::Start => {
                // Address registration happens in the transport; nothing to
                // do at the protocol layer.
            }
            other => {
                tracing::debug!(replica = %self.pid, kind = %other, from = %from,
                    "ignoring message kind outside the replica protocol");
            }
        }
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    /// The speculative response for the current operation: the operation
    /// itself, or a deliberately mangled copy when simulating a fault.
    pub(crate) fn speculative_response(&self, op: &Operation) -> Operation {
        if self.faulty == 0 {
            op.clone()
        } else {
            Operation(
                op.key().clone(),
                Scalar::Text(format!("{}FAULTY{}", op.value(), self.pid)),
            )
        }
    }

    /// Begins speculative execution of `cur`. The delay draw decides between
    /// finishing inline (the common path) and asking the runtime to wait out
    /// the slow path first.
    pub(crate) fn begin_execution(&mut self, out: &mut ReplicaOutput) {
        let Some(op) = self.cur.clone() else {
            return;
        };
        self.phase = Phase::Elaboration;

        let lo = self.ex_time.lo().min(self.ex_time.hi());
        let hi = self.ex_time.lo().max(self.ex_time.hi());
        let draw = self.rng.gen_range(lo..=hi);
        if draw <= self.ex_time.threshold() {
            tracing::debug!(replica = %self.pid, op = %op, "execution takes the slow path");
            out.execution = Some(ExecutionStart {
                config: self.config,
                op,
            });
        } else {
            self.finish_execution(out);
        }
    }

    /// Completes speculative execution: fixes `r` and `t`, moves to the
    /// waiting phase, and (on followers) reports the digest to the leader.
    pub(crate) fn finish_execution(&mut self, out: &mut ReplicaOutput) {
        let Some(op) = self.cur.clone() else {
            return;
        };
        let response = self.speculative_response(&op);
        let waiting = if self.is_leader() {
            Phase::WaitingApproval
        } else {
            Phase::WaitingOrder
        };
        self.spec_phase = Some(waiting);
        self.phase = waiting;

        if !self.is_leader() {
            let sign = sign_response(&response);
            out.to(self.leader, Message::approve(self.config, op, sign));
        }
        self.response = Some(response);
    }

    /// Clears every per-operation field. Commit, abort and epoch install all
    /// funnel through this.
    pub(crate) fn clear_operation_state(&mut self) {
        self.cur = None;
        self.cur_pid = None;
        self.response = None;
        self.spec_phase = None;
        self.last_order = None;
        self.msg_buffer.clear();
    }

    /// Sends a terminal output to the client that originated `op`, falling
    /// back to the client broadcast scope when the origin is unknown (for
    /// example after inheriting work from a previous leader that never
    /// learned it).
    pub(crate) fn output_to_client(
        &mut self,
        out: &mut ReplicaOutput,
        op: Option<&Operation>,
        kind: MessageKind,
        data: serde_json::Value,
    ) {
        let message = Message::output(kind, self.config, data);
        match op.and_then(|o| self.clients.get(o)).copied() {
            Some(client) => out.to(client, message),
            None => out.broadcast(Scope::Clients, message),
        }
    }

    /// JSON payload for outputs that carry the operation itself.
    pub(crate) fn op_payload(op: &Operation) -> serde_json::Value {
        serde_json::to_value(op).unwrap_or(serde_json::Value::Null)
    }

    /// Snapshot of the pending work handed to an incoming leader.
    pub(crate) fn leader_buffer_snapshot(&self) -> LeaderBuffer {
        LeaderBuffer {
            buffer: self.buffer.iter().map(|(p, o)| (*p, o.clone())).collect(),
            queue: self.buffer_queue.clone(),
            clients: self
                .clients
                .iter()
                .map(|(o, c)| (o.clone(), *c))
                .collect(),
        }
    }

    /// Drops the submitter's slot in `B` when the current operation retires
    /// (commit or abort on the leader).
    pub(crate) fn retire_current_slot(&mut self) {
        if let Some(submitter) = self.cur_pid {
            self.buffer.remove(&submitter);
        }
    }
}
