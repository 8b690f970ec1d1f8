//! The replica runtime: three cooperating tasks around one state machine.
//!
//! - **Listener**: receives from the socket, pushes `(message, sender)` onto
//!   the bounded inbox. Drops datagrams when the inbox is full.
//! - **Executor**: the only writer of protocol state. Drains the inbox,
//!   injects a tick every slice, applies outputs to the transport, and
//!   launches slow executions.
//! - **Age checker**: enqueues an age-scan event ~10 times a second; the
//!   executor performs the actual scan, so queue mutations stay serialised.
//!
//! Slow executions run on spawned tasks that sleep in 10 ms slices, watching
//! a `(config, phase)` snapshot; an epoch change or shutdown makes them
//! vanish without a trace.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use sievekv_config::Bootstrap;
use sievekv_rsm::{ExecutionStart, Outbound, ReplicaEvent, ReplicaOutput, ReplicaState, Timing};
use sievekv_transport::{Transport, TransportError};
use sievekv_types::{Epoch, Phase, Scope};
use sievekv_wire::Message;

use crate::inbox::{Inbox, PushResult};

/// Runtime failures. Protocol-level trouble never lands here; only the
/// socket can fail the runtime.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Executor pacing and inbox sizing.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Protocol timers.
    pub timing: Timing,
    /// Executor slice; also the granularity of slow-execution cancellation.
    pub tick_interval: Duration,
    /// Age-checker period.
    pub age_scan_interval: Duration,
    /// Bounded inbox capacity.
    pub inbox_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            tick_interval: Duration::from_millis(10),
            age_scan_interval: Duration::from_millis(100),
            inbox_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Runtime with compressed protocol timers, for tests.
    #[must_use]
    pub fn with_timing(timing: Timing) -> Self {
        Self {
            timing,
            ..Self::default()
        }
    }
}

/// Snapshot published by the executor for slow-execution cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PhaseSnapshot {
    config: Epoch,
    phase: Phase,
}

/// A running replica.
pub struct Replica {
    executor: JoinHandle<Result<(), ServerError>>,
    listener: JoinHandle<()>,
    age_checker: JoinHandle<()>,
}

impl Replica {
    /// Binds the transport, announces the replica with START, and spawns the
    /// three runtime tasks.
    pub async fn spawn(
        bootstrap: &Bootstrap,
        runtime: RuntimeConfig,
    ) -> Result<Self, ServerError> {
        let transport = Arc::new(Transport::bind(bootstrap).await?);
        let state = ReplicaState::new(
            bootstrap.process_id,
            bootstrap.n_processes,
            bootstrap.faulty,
            runtime.timing,
        );

        transport.broadcast(Scope::Replicas, &Message::start()).await;

        let inbox = Arc::new(Inbox::new(runtime.inbox_capacity));
        let (phase_tx, phase_rx) = watch::channel(PhaseSnapshot {
            config: state.config(),
            phase: state.phase(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = tokio::spawn(listen(
            Arc::clone(&transport),
            Arc::clone(&inbox),
            shutdown_rx.clone(),
        ));
        let age_checker = tokio::spawn(check_ages(
            Arc::clone(&inbox),
            runtime.age_scan_interval,
            shutdown_rx.clone(),
        ));
        let executor = tokio::spawn(execute(
            state,
            transport,
            Arc::clone(&inbox),
            runtime,
            phase_tx,
            phase_rx,
            shutdown_tx,
        ));

        Ok(Self {
            executor,
            listener,
            age_checker,
        })
    }

    /// Waits for the replica to shut down (a CLOSE message).
    pub async fn join(self) -> Result<(), ServerError> {
        let result = match self.executor.await {
            Ok(result) => result,
            Err(join) => {
                tracing::error!(%join, "executor task failed");
                Ok(())
            }
        };
        self.listener.abort();
        self.age_checker.abort();
        result
    }

    /// Tears the replica down without waiting for CLOSE.
    pub fn abort(self) {
        self.executor.abort();
        self.listener.abort();
        self.age_checker.abort();
    }
}

// ============================================================================
// Listener
// ============================================================================

async fn listen(
    transport: Arc<Transport>,
    inbox: Arc<Inbox<ReplicaEvent>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            received = transport.recv() => received,
            _ = shutdown.changed() => return,
        };
        match received {
            Ok((from, message)) => {
                let event = ReplicaEvent::Inbound {
                    from,
                    message,
                    now: Instant::now(),
                };
                if let PushResult::Backpressure(dropped) = inbox.try_push(event) {
                    tracing::warn!(pid = %transport.self_pid(), ?dropped,
                        "inbox full, dropping datagram");
                }
            }
            Err(reason) => {
                tracing::warn!(pid = %transport.self_pid(), %reason, "receive failed");
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

// ============================================================================
// Age checker
// ============================================================================

async fn check_ages(
    inbox: Arc<Inbox<ReplicaEvent>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        let _ = inbox.try_push(ReplicaEvent::AgeScan {
            now: Instant::now(),
        });
    }
}

// ============================================================================
// Executor
// ============================================================================

async fn execute(
    mut state: ReplicaState,
    transport: Arc<Transport>,
    inbox: Arc<Inbox<ReplicaEvent>>,
    runtime: RuntimeConfig,
    phase_tx: watch::Sender<PhaseSnapshot>,
    phase_rx: watch::Receiver<PhaseSnapshot>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), ServerError> {
    loop {
        let mut events = inbox.pop_batch(runtime.inbox_capacity);
        events.push(ReplicaEvent::Tick {
            now: Instant::now(),
        });

        let mut closing = false;
        for event in events {
            let (next, output) = state.on_event(event);
            state = next;
            phase_tx.send_replace(PhaseSnapshot {
                config: state.config(),
                phase: state.phase(),
            });
            closing |= output.closing;
            apply(&transport, &inbox, &runtime, &phase_rx, output).await;
        }

        if closing {
            tracing::info!(pid = %transport.self_pid(), "executor closing");
            let _ = shutdown_tx.send(true);
            return Ok(());
        }
        tokio::time::sleep(runtime.tick_interval).await;
    }
}

async fn apply(
    transport: &Arc<Transport>,
    inbox: &Arc<Inbox<ReplicaEvent>>,
    runtime: &RuntimeConfig,
    phase_rx: &watch::Receiver<PhaseSnapshot>,
    output: ReplicaOutput,
) {
    for outbound in output.outbound {
        match outbound {
            Outbound::To(pid, message) => transport.send(pid, &message).await,
            Outbound::Broadcast(scope, message) => transport.broadcast(scope, &message).await,
        }
    }
    if let Some(execution) = output.execution {
        spawn_slow_execution(
            execution,
            runtime.timing.complain_threshold,
            runtime.tick_interval,
            phase_rx.clone(),
            Arc::clone(inbox),
        );
    }
}

/// Simulates a long execution: sleep in slices, abandoning the wait when the
/// replica leaves ELABORATION or the epoch turns over, then feed the
/// completion back through the inbox.
fn spawn_slow_execution(
    execution: ExecutionStart,
    run_for: Duration,
    slice: Duration,
    phase_rx: watch::Receiver<PhaseSnapshot>,
    inbox: Arc<Inbox<ReplicaEvent>>,
) {
    tokio::spawn(async move {
        let deadline = Instant::now() + run_for;
        while Instant::now() < deadline {
            tokio::time::sleep(slice).await;
            let snapshot = *phase_rx.borrow();
            if snapshot.config != execution.config || snapshot.phase != Phase::Elaboration {
                return;
            }
        }
        let event = ReplicaEvent::ExecutionComplete {
            config: execution.config,
            op: execution.op,
        };
        if let PushResult::Backpressure(_) = inbox.try_push(event) {
            tracing::warn!("inbox full, dropping execution completion");
        }
    });
}
