//! Client stub for the sievekv cluster.
//!
//! A client submits operations with CLIENT_INVOKE to any replica, reads with
//! REQUEST_VALUE, and receives exactly one terminal outcome per operation
//! (COMMIT, ABORT, ROLLBACK, COMPLAIN, OPERATION_NOT_QUEUED, or — after a
//! leader change — NEW_SIEVE_CONFIG). Responses land in a single
//! last-message slot; callers poll with [`Client::take_response`] or wait
//! with [`Client::await_message`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;

use sievekv_config::Bootstrap;
use sievekv_transport::{Transport, TransportError};
use sievekv_types::{Operation, ProcessId, Scalar, Scope};
use sievekv_wire::{DelayProfile, Message};

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The single last-response slot, as the operator console consumes it.
type History = Arc<Mutex<Option<(ProcessId, Message)>>>;

/// A connected cluster client.
pub struct Client {
    transport: Arc<Transport>,
    n_replicas: usize,
    history: History,
    listener: JoinHandle<()>,
}

impl Client {
    /// Binds the client endpoint, starts the response listener, and
    /// announces the client's address with START.
    pub async fn connect(bootstrap: &Bootstrap) -> Result<Self, ClientError> {
        let transport = Arc::new(Transport::bind(bootstrap).await?);
        let history: History = Arc::new(Mutex::new(None));

        let listener = tokio::spawn(listen(Arc::clone(&transport), Arc::clone(&history)));

        let client = Self {
            transport,
            n_replicas: bootstrap.n_processes,
            history,
            listener,
        };
        client.broadcast(&Message::start()).await;
        Ok(client)
    }

    /// Submits `(key, value)` to a random replica.
    pub async fn invoke(&self, key: impl Into<Scalar>, value: impl Into<Scalar>) {
        let target = self.random_replica();
        self.invoke_via(target, key, value).await;
    }

    /// Submits `(key, value)` through a chosen replica.
    pub async fn invoke_via(
        &self,
        replica: ProcessId,
        key: impl Into<Scalar>,
        value: impl Into<Scalar>,
    ) {
        let op = Operation::new(key, value);
        tracing::debug!(%op, via = %replica, "invoking");
        self.transport
            .send(replica, &Message::client_invoke(op))
            .await;
    }

    /// Asks a random replica for the value under `key`. The answer is a
    /// local (possibly stale) read.
    pub async fn request_value(&self, key: impl Into<Scalar>) {
        let target = self.random_replica();
        self.request_value_from(target, key).await;
    }

    /// Asks a chosen replica for the value under `key`.
    pub async fn request_value_from(&self, replica: ProcessId, key: impl Into<Scalar>) {
        self.transport
            .send(replica, &Message::request_value(key.into()))
            .await;
    }

    /// Sets the execution delay profile on every replica.
    pub async fn set_ex_time(&self, profile: DelayProfile) {
        self.broadcast(&Message::debug_ex_time(profile)).await;
    }

    /// Marks one replica faulty (nonzero) or correct (zero).
    pub async fn set_faulty(&self, replica: ProcessId, flag: u64) {
        self.transport
            .send(replica, &Message::debug_faulty(flag))
            .await;
    }

    /// Drives the whole cluster to CLOSING.
    pub async fn close_cluster(&self) {
        self.broadcast(&Message::close()).await;
    }

    /// Sends a record to every replica.
    pub async fn broadcast(&self, message: &Message) {
        self.transport.broadcast(Scope::Replicas, message).await;
    }

    /// Takes the last response out of the slot, if any.
    pub fn take_response(&self) -> Option<(ProcessId, Message)> {
        self.history.lock().expect("history lock").take()
    }

    /// Polls the response slot until `accept` keeps one, or the deadline
    /// passes. Responses the predicate rejects are discarded, mirroring how
    /// the operator console skips intermediate outcomes.
    pub async fn await_message<F>(
        &self,
        timeout: Duration,
        mut accept: F,
    ) -> Option<(ProcessId, Message)>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((from, message)) = self.take_response() {
                if accept(&message) {
                    return Some((from, message));
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stops the response listener.
    pub fn shutdown(self) {
        self.listener.abort();
    }

    fn random_replica(&self) -> ProcessId {
        let pick = rand::thread_rng().gen_range(1..=self.n_replicas as u64);
        ProcessId::new(pick)
    }
}

async fn listen(transport: Arc<Transport>, history: History) {
    loop {
        match transport.recv().await {
            Ok((from, message)) => {
                tracing::debug!(%from, kind = %message.kind, "client received");
                *history.lock().expect("history lock") = Some((from, message));
            }
            Err(reason) => {
                tracing::warn!(%reason, "client receive failed");
                return;
            }
        }
    }
}
