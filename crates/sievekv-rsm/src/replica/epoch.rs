//! Liveness: complaints, rollback, and epoch (leader) change.

use std::time::Instant;

use sievekv_types::{Phase, ProcessId, Scope};
use sievekv_wire::{Message, MessageKind};

use super::{ReplicaOutput, ReplicaState};

impl ReplicaState {
    // ========================================================================
    // Complaints
    // ========================================================================

    /// COMPLAIN at the leader, about the current round: notify the client,
    /// roll the operation back, and hand leadership over.
    pub(crate) fn on_complain(&mut self, message: &Message, out: &mut ReplicaOutput) {
        if !self.is_leader()
            || message.config != Some(self.config)
            || message.op.is_none()
            || message.op != self.cur
        {
            return;
        }
        let op = self.cur.clone();
        tracing::info!(
            replica = %self.pid,
            op = ?op,
            complainer = ?message.pid,
            "complaint about current operation"
        );
        self.output_to_client(
            out,
            op.as_ref(),
            MessageKind::Complain,
            op.as_ref().map(Self::op_payload).unwrap_or_default(),
        );
        self.abort_current(true, out);
        if let Some(op) = &op {
            self.clients.remove(op);
        }
    }

    /// Scan `I` for operations the leader has been sitting on. Only runs
    /// while some operation is actually in flight: age alone says nothing
    /// when the cluster is idle mid-epoch-change. The whole backlog is
    /// settled in one pass, because a complaint about the in-flight operation
    /// clears `cur` moments later and would otherwise strand the rest.
    pub(crate) fn on_age_scan(&mut self, now: Instant, out: &mut ReplicaOutput) {
        if self.is_leader() || self.phase == Phase::Closing || self.cur.is_none() {
            return;
        }
        while let Some(op) = self
            .invoked
            .first_over_age(now, self.timing.op_max_age)
            .cloned()
        {
            self.invoked.remove(&op);

            if Some(&op) == self.cur.as_ref() {
                tracing::info!(replica = %self.pid, op = %op, "current operation over age, complaining");
                out.to(
                    self.leader,
                    Message::complain(self.config, self.cur.clone(), self.pid),
                );
            } else {
                // The leader silently dropped this as a duplicate submission
                // while another of ours was pending; tell the client.
                tracing::info!(replica = %self.pid, op = %op, "dropped operation over age");
                self.output_to_client(
                    out,
                    Some(&op),
                    MessageKind::OperationNotQueued,
                    Self::op_payload(&op),
                );
                self.clients.remove(&op);
            }
        }
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    /// Leader-side abort of the current round: ROLLBACK to the client, retire
    /// the `B` slot, ABORT broadcast, then either back to S0 or into a leader
    /// change.
    pub(crate) fn abort_current(&mut self, new_config: bool, out: &mut ReplicaOutput) {
        let op = self.cur.clone();
        if let Some(op) = &op {
            self.output_to_client(
                out,
                Some(op),
                MessageKind::Rollback,
                Self::op_payload(op),
            );
        }
        self.next_epoch = None;
        self.next_leader = None;
        self.retire_current_slot();
        if let Some(op) = op {
            self.invoked.remove(&op);
            out.broadcast(Scope::Replicas, Message::abort(self.config, op));
        }
        self.clear_operation_state();
        self.phase = if new_config { Phase::NewConfig } else { Phase::S0 };
    }

    // ========================================================================
    // Epoch change
    // ========================================================================

    /// NEW_SIEVE_CONFIG. Two shapes arrive here:
    ///
    /// - The current leader's **initiating** announcement (flagged via
    ///   `generic-data`): adopt `(next_epoch, next_leader)`; the chosen
    ///   leader additionally inherits the pending work and re-broadcasts.
    /// - A **supporting** announcement: collected like validations, with the
    ///   epoch installed once more than `2f` agree.
    pub(crate) fn on_new_sieve_config(
        &mut self,
        message: Message,
        from: ProcessId,
        now: Instant,
        out: &mut ReplicaOutput,
    ) {
        let (Some(new_epoch), Some(new_leader)) = (message.config, message.pid) else {
            return;
        };

        if from == self.leader && new_epoch > self.config && message.generic_data.is_some() {
            // A conflicting pick for the same round voids what we collected.
            if self.next_epoch == Some(new_epoch)
                && self.next_leader.is_some()
                && self.next_leader != Some(new_leader)
            {
                self.msg_buffer.clear();
            }
            self.next_epoch = Some(new_epoch);
            self.next_leader = Some(new_leader);
            tracing::info!(
                replica = %self.pid, next_epoch = %new_epoch, next_leader = %new_leader,
                "leader initiated new sieve config"
            );

            if self.pid == new_leader {
                if let Some(inherited) = message.leader_buffer {
                    tracing::info!(
                        replica = %self.pid,
                        pending = inherited.buffer.len(),
                        "inheriting leader buffer"
                    );
                    self.buffer = inherited.buffer.into_iter().collect();
                    self.buffer_queue = inherited.queue;
                    for (op, client) in inherited.clients {
                        self.clients.insert(op, client);
                    }
                }
                let announcement = self.announcement(new_epoch, new_leader, false);
                out.broadcast(Scope::Replicas, announcement);
            }
        } else if self.validates(&message) {
            self.msg_buffer
                .retain(|_, buffered| buffered.kind != MessageKind::Validation);
            self.msg_buffer.insert(from, message);

            if self.msg_buffer.len() > 2 * self.f {
                self.install_epoch(now, out);
            } else if from == new_leader {
                // First sight of the chosen leader's own announcement:
                // support it so the round can close everywhere.
                let announcement = self.announcement(new_epoch, new_leader, false);
                out.broadcast(Scope::Replicas, announcement);
            }
        }
    }

    /// Executor tick while in NEW_CONFIG: restart a stale round, then open a
    /// fresh one with a random next leader.
    pub(crate) fn drive_new_config(&mut self, now: Instant, out: &mut ReplicaOutput) {
        if let Some(started) = self.round_started {
            if now.saturating_duration_since(started) > self.timing.new_config_threshold {
                tracing::info!(replica = %self.pid, "new sieve config round stale, restarting");
                self.round_started = None;
                self.msg_buffer.clear();
            }
        }
        if self.round_started.is_none() {
            let (next_epoch, next_leader) = self.choose_next_leader();
            let announcement = self.announcement(next_epoch, next_leader, true);
            out.broadcast(Scope::Replicas, announcement);
            self.round_started = Some(now);
        }
    }

    /// Picks the next leader uniformly from the other replicas. Correctness
    /// does not depend on the pick; termination rides on the round-restart
    /// timer.
    fn choose_next_leader(&mut self) -> (sievekv_types::Epoch, ProcessId) {
        use rand::Rng;
        let candidate = loop {
            let pick = ProcessId::new(self.rng.gen_range(1..=self.n as u64));
            if pick != self.pid {
                break pick;
            }
        };
        let next_epoch = self.config.next();
        self.next_leader = Some(candidate);
        self.next_epoch = Some(next_epoch);
        tracing::info!(
            replica = %self.pid, next_epoch = %next_epoch, next_leader = %candidate,
            "proposing new leader"
        );
        (next_epoch, candidate)
    }

    /// Builds a NEW_SIEVE_CONFIG announcement. The current leader attaches
    /// its pending work; only its first announcement carries the initiating
    /// flag.
    pub(crate) fn announcement(
        &self,
        epoch: sievekv_types::Epoch,
        leader: ProcessId,
        initiating: bool,
    ) -> Message {
        let mut message = Message::new_sieve_config(epoch, leader);
        if self.is_leader() {
            message = message.with_leader_buffer(self.leader_buffer_snapshot());
            if initiating {
                message = message.initiating();
            }
        }
        message
    }

    /// Installs `(next_epoch, next_leader)`: the epoch turns over atomically,
    /// collections are purged, ages restart, and the incoming leader tells
    /// the clients about the handover.
    fn install_epoch(&mut self, now: Instant, out: &mut ReplicaOutput) {
        let (Some(epoch), Some(leader)) = (self.next_epoch, self.next_leader) else {
            return;
        };
        self.config = epoch;
        self.leader = leader;
        self.clear_operation_state();

        if self.is_leader() {
            let pending = self.leader_buffer_snapshot();
            let payload = serde_json::to_value((self.leader, &pending.buffer, &pending.queue))
                .unwrap_or(serde_json::Value::Null);
            out.broadcast(
                Scope::Clients,
                Message::output(MessageKind::NewSieveConfig, self.config, payload),
            );
        } else {
            self.buffer.clear();
            self.buffer_queue.clear();
            self.clients.clear();
        }

        self.invoked.reset_ages(now);
        self.round_started = None;
        self.phase = Phase::S0;
        tracing::info!(
            replica = %self.pid, config = %self.config, leader = %self.leader,
            "installed new sieve config"
        );
    }
}
