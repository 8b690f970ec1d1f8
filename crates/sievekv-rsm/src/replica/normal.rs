//! Normal-operation handlers: invocation, speculative execution, approval
//! tally, ordering, validation, commit and abort.

use std::time::Instant;

use sievekv_crypto::sign_response;
use sievekv_types::{Phase, ProcessId, Scalar, Scope};
use sievekv_wire::{Message, MessageKind};

use crate::quorum::{confirms_own_response, justifies_abort, largest_signature_group};

use super::{ReplicaOutput, ReplicaState};

impl ReplicaState {
    // ========================================================================
    // Invocation path
    // ========================================================================

    /// CLIENT_INVOKE from client `from`: queue the operation and hand it to
    /// the leader. A leader handles its own submissions as ordinary INVOKEs.
    pub(crate) fn on_client_invoke(
        &mut self,
        message: Message,
        from: ProcessId,
        now: Instant,
        out: &mut ReplicaOutput,
    ) {
        let Some(op) = message.op else {
            return;
        };
        tracing::debug!(replica = %self.pid, op = %op, client = %from, "client invoke");

        self.clients.insert(op.clone(), from);
        if self.is_leader() {
            let invoke = Message::invoke(self.config, op, from);
            self.on_invoke(invoke, self.pid);
        } else {
            self.invoked.insert(op.clone(), now);
            out.to(self.leader, Message::invoke(self.config, op, from));
        }
    }

    /// INVOKE at the leader: admit `(submitter, op)` into `B`, FIFO. A
    /// submitter already holding a slot is silently dropped; the submitting
    /// replica's age checker reports such operations back to the client.
    pub(crate) fn on_invoke(&mut self, message: Message, from: ProcessId) {
        if !self.is_leader()
            || message.config != Some(self.config)
            || self.buffer.contains_key(&from)
        {
            return;
        }
        let Some(op) = message.op else {
            return;
        };
        if let Some(client) = message.pid {
            self.clients.insert(op.clone(), client);
        }
        tracing::debug!(replica = %self.pid, op = %op, submitter = %from, "buffered invoke");
        self.buffer_queue.push(from);
        self.buffer.insert(from, op);
    }

    // ========================================================================
    // Ordering (leader, driven by the executor tick)
    // ========================================================================

    pub(crate) fn on_tick(&mut self, now: Instant, out: &mut ReplicaOutput) {
        match self.phase {
            Phase::S0 => self.admit_next(out),
            Phase::NewConfig => self.drive_new_config(now, out),
            _ => {}
        }
    }

    /// Pops the oldest buffered submission and broadcasts EXECUTE for it.
    /// At most one operation is in flight: `cur` must be empty.
    fn admit_next(&mut self, out: &mut ReplicaOutput) {
        if !self.is_leader() || self.cur.is_some() || self.buffer.is_empty() {
            return;
        }
        while !self.buffer_queue.is_empty() {
            let submitter = self.buffer_queue.remove(0);
            let Some(op) = self.buffer.get(&submitter).cloned() else {
                // Head retired by an earlier abort; skip it.
                continue;
            };
            tracing::info!(replica = %self.pid, op = %op, submitter = %submitter, "ordering");
            self.cur = Some(op.clone());
            self.cur_pid = Some(submitter);
            out.broadcast(Scope::Replicas, Message::execute(self.config, op));
            self.begin_execution(out);
            return;
        }
    }

    // ========================================================================
    // Speculative execution
    // ========================================================================

    /// EXECUTE from the leader: speculatively execute, then report the
    /// response digest. Ignored while a previous speculation is still open.
    pub(crate) fn on_execute(&mut self, message: Message, out: &mut ReplicaOutput) {
        if message.config != Some(self.config)
            || self.spec_phase.is_some()
            || self.phase == Phase::Elaboration
        {
            return;
        }
        let Some(op) = message.op else {
            return;
        };
        self.cur = Some(op);
        self.begin_execution(out);
    }

    /// A slow execution finished. Stale completions (epoch moved, operation
    /// replaced, phase left ELABORATION) are dropped.
    pub(crate) fn on_execution_complete(
        &mut self,
        config: sievekv_types::Epoch,
        op: &sievekv_types::Operation,
        out: &mut ReplicaOutput,
    ) {
        if config != self.config
            || self.phase != Phase::Elaboration
            || self.cur.as_ref() != Some(op)
        {
            return;
        }
        self.finish_execution(out);
    }

    // ========================================================================
    // Approval tally (leader)
    // ========================================================================

    /// APPROVE at the leader. Once `2f` replies arrived the leader adds its
    /// own (for `2f + 1`), partitions by digest, and proposes CONFIRM iff the
    /// largest group exceeds `f`, else ABORT with the full tally as proof.
    pub(crate) fn on_approve(
        &mut self,
        message: Message,
        from: ProcessId,
        out: &mut ReplicaOutput,
    ) {
        self.msg_buffer.insert(from, message);
        if self.msg_buffer.len() < 2 * self.f {
            return;
        }
        let (Some(cur), Some(response)) = (self.cur.clone(), self.response.clone()) else {
            return;
        };

        let mut tally = self.msg_buffer.clone();
        tally.insert(
            self.pid,
            Message::approve(self.config, cur.clone(), sign_response(&response)),
        );
        let correct = largest_signature_group(&tally, self.config, &cur);

        // Entering the validation phase: drop the approvals, keep whatever
        // other kinds drifted in.
        self.msg_buffer = tally
            .iter()
            .filter(|(_, m)| m.kind != MessageKind::Approve)
            .map(|(p, m)| (*p, m.clone()))
            .collect();

        let order = if correct.len() > self.f {
            tracing::info!(
                replica = %self.pid, op = %cur, group = correct.len(),
                "proposing CONFIRM"
            );
            let proposed = if correct.contains_key(&self.pid) {
                response
            } else {
                // Own response was outvoted; propose the canonical answer
                // derived from the operation itself.
                cur.clone()
            };
            self.spec_phase = Some(Phase::Commit);
            Message::order(
                MessageKind::Confirm,
                self.config,
                cur,
                Phase::Commit,
                proposed,
                correct,
            )
        } else {
            tracing::info!(
                replica = %self.pid, op = %cur, group = correct.len(),
                "no correct quorum, proposing ABORT"
            );
            self.spec_phase = Some(Phase::Abort);
            Message::order(
                MessageKind::Abort,
                self.config,
                cur,
                Phase::Abort,
                response,
                tally,
            )
        };

        self.last_order = Some(order.clone());
        out.broadcast(Scope::Replicas, order);
        self.phase = Phase::WaitingValidation;
    }

    // ========================================================================
    // Order validation (followers)
    // ========================================================================

    /// ORDER from the leader: record it and answer with this replica's
    /// verdict.
    pub(crate) fn on_order(&mut self, message: Message, out: &mut ReplicaOutput) {
        let verdict = if self.validates(&message) {
            MessageKind::Confirm
        } else {
            MessageKind::Abort
        };
        let has_decision = matches!(
            message.decision,
            Some(MessageKind::Confirm | MessageKind::Abort)
        );
        self.last_order = Some(message);
        if has_decision {
            out.to(
                self.leader,
                Message::validation(verdict, self.config, self.cur.clone()),
            );
        }
    }

    /// The validation predicate: does this replica endorse the message?
    pub(crate) fn validates(&self, message: &Message) -> bool {
        match message.kind {
            MessageKind::Order => {
                let confirm_holds = message.config == Some(self.config)
                    && message.op.is_some()
                    && message.op == self.cur
                    && match (&self.response, &message.msg_set) {
                        (Some(response), Some(set)) => {
                            confirms_own_response(set, response, self.f)
                        }
                        _ => false,
                    };
                if confirm_holds {
                    return true;
                }
                message.decision == Some(MessageKind::Abort)
                    && message.msg_set.as_ref().is_some_and(|set| {
                        justifies_abort(set, self.f, self.config, self.cur.as_ref())
                    })
            }
            MessageKind::NewSieveConfig => match (self.next_epoch, self.next_leader) {
                (Some(next_epoch), Some(next_leader)) => {
                    message.config.is_some_and(|c| c <= next_epoch)
                        && message.pid == Some(next_leader)
                }
                _ => false,
            },
            _ => false,
        }
    }

    // ========================================================================
    // Validation tally (leader)
    // ========================================================================

    /// VALIDATION at the leader. Once more than `2f` verdicts arrived, count
    /// the CONFIRMs about the current round and settle the operation.
    pub(crate) fn on_validation(
        &mut self,
        message: Message,
        from: ProcessId,
        out: &mut ReplicaOutput,
    ) {
        self.msg_buffer.insert(from, message);
        if self.msg_buffer.len() <= 2 * self.f {
            return;
        }

        let cur = self.cur.clone();
        let confirms = self
            .msg_buffer
            .values()
            .filter(|m| {
                m.decision == Some(MessageKind::Confirm)
                    && m.config == Some(self.config)
                    && m.op == cur
            })
            .count();

        match self.spec_phase {
            Some(Phase::Commit) => {
                if confirms > self.f {
                    self.commit_current(out);
                } else {
                    // The cluster rejected our CONFIRM: involuntary abort,
                    // and the leadership is in question.
                    self.abort_current(true, out);
                    self.output_to_client(
                        out,
                        cur.as_ref(),
                        MessageKind::Abort,
                        cur.as_ref().map(Self::op_payload).unwrap_or_default(),
                    );
                    if let Some(op) = &cur {
                        self.clients.remove(op);
                    }
                }
            }
            Some(Phase::Abort) => {
                // Outcome is abort either way; an agreed abort also means the
                // cluster saw what we saw, and the epoch turns over.
                self.abort_current(confirms > self.f, out);
                self.output_to_client(
                    out,
                    cur.as_ref(),
                    MessageKind::Abort,
                    cur.as_ref().map(Self::op_payload).unwrap_or_default(),
                );
                if let Some(op) = &cur {
                    self.clients.remove(op);
                }
            }
            _ => {
                self.msg_buffer.clear();
            }
        }
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Settles a confirmed operation on the leader: apply, retire the `B`
    /// slot, broadcast COMMIT, deliver the terminal output.
    fn commit_current(&mut self, out: &mut ReplicaOutput) {
        let Some(op) = self.cur.clone() else {
            return;
        };
        let in_correct_group = self
            .last_order
            .as_ref()
            .and_then(|o| o.msg_set.as_ref())
            .is_some_and(|set| set.contains_key(&self.pid));

        self.apply_commit(in_correct_group);
        self.retire_current_slot();
        out.broadcast(Scope::Replicas, Message::commit(self.config, op.clone()));
        self.output_to_client(out, Some(&op), MessageKind::Commit, Self::op_payload(&op));
        tracing::info!(replica = %self.pid, op = %op, config = %self.config, "committed");

        self.invoked.remove(&op);
        self.clients.remove(&op);
        self.clear_operation_state();
        // A leader whose own response was outvoted corrected itself from the
        // proposed response; it also steps down.
        self.phase = if in_correct_group {
            Phase::S0
        } else {
            Phase::NewConfig
        };
    }

    /// COMMIT broadcast at a follower: apply own response if this replica was
    /// in the correct group, otherwise adopt the leader's proposed response.
    pub(crate) fn on_commit_broadcast(&mut self) {
        if let Some(order) = self.last_order.take() {
            let in_correct_group = order
                .msg_set
                .as_ref()
                .is_some_and(|set| set.contains_key(&self.pid));
            self.apply_from_order(in_correct_group, order.spec_response);
            if let Some(op) = order.op.or_else(|| self.cur.clone()) {
                self.invoked.remove(&op);
                self.clients.remove(&op);
                tracing::debug!(replica = %self.pid, op = %op, "applied commit");
            }
        }
        self.clear_operation_state();
        self.phase = Phase::S0;
    }

    fn apply_commit(&mut self, in_correct_group: bool) {
        let proposed = self
            .last_order
            .as_ref()
            .and_then(|o| o.spec_response.clone());
        self.apply_from_order(in_correct_group, proposed);
    }

    fn apply_from_order(
        &mut self,
        in_correct_group: bool,
        proposed: Option<sievekv_types::Operation>,
    ) {
        if in_correct_group {
            if let Some(response) = self.response.clone() {
                self.dictionary.insert(response.0, response.1);
            }
        } else if let Some(correction) = proposed {
            // Self-correction: this replica's own speculation disagreed with
            // the majority, so the leader-provided response wins.
            tracing::debug!(replica = %self.pid, correction = %correction, "adopting corrected response");
            self.dictionary.insert(correction.0, correction.1);
        }
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// ABORT broadcast at a follower: structural cleanup, no dictionary
    /// mutation. The named operation leaves `I` so it cannot later surface a
    /// second terminal outcome; the leader's ROLLBACK/ABORT output already
    /// settled it for the client.
    pub(crate) fn on_abort_broadcast(&mut self, message: &Message) {
        if let Some(op) = &message.op {
            self.invoked.remove(op);
            self.clients.remove(op);
        }
        self.next_epoch = None;
        self.next_leader = None;
        self.clear_operation_state();
        self.phase = Phase::S0;
    }

    // ========================================================================
    // Reads and debug knobs
    // ========================================================================

    /// REQUEST_VALUE from a client: answer from the local dictionary, null
    /// when the key was never committed here.
    pub(crate) fn on_request_value(
        &mut self,
        message: &Message,
        from: ProcessId,
        out: &mut ReplicaOutput,
    ) {
        let Some(op) = &message.op else {
            return;
        };
        let key = op.key().clone();
        let value = self.lookup(&key).cloned().unwrap_or(Scalar::Null);
        let payload = serde_json::to_value((&key, &value)).unwrap_or(serde_json::Value::Null);
        out.to(
            from,
            Message::output(MessageKind::RequestValue, self.config, payload),
        );
    }

    /// DEBUG: simulation knobs.
    pub(crate) fn on_debug(&mut self, message: &Message) {
        if let Some(flag) = message.debug_faulty {
            tracing::info!(replica = %self.pid, flag, "debug: set faulty flag");
            self.faulty = flag;
        }
        if let Some(profile) = message.debug_ex_time {
            tracing::info!(replica = %self.pid, ?profile, "debug: set execution delay profile");
            self.ex_time = profile;
        }
    }
}
