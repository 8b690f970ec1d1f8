//! Encrypted datagram transport.
//!
//! One UDP endpoint per process. Every outbound record is JSON-encoded, then
//! sealed under the destination peer's derived key; inbound datagrams are
//! identified by source address, opened under the sender's key, and parsed.
//! There is no ordering, no delivery guarantee, and no retry here — the
//! protocol's timers own recovery, so transport failures are logged and
//! swallowed.
//!
//! Peers split into two scopes: replicas (known topology, fixed ports) and
//! clients (learned from inbound traffic). Unknown senders on high ports are
//! admitted as transient clients and assigned ids above the replica range.

mod peers;

pub use peers::{PeerTable, TRANSIENT_PORT_FLOOR};

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::BytesMut;
use tokio::net::UdpSocket;

use sievekv_config::Bootstrap;
use sievekv_types::{ProcessId, Scope};
use sievekv_wire::Message;

/// Transport construction and receive errors. Send-path failures never
/// surface: they are logged and dropped by design.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("transport is closed")]
    Closed,
}

/// A bound, encrypting UDP endpoint.
pub struct Transport {
    socket: UdpSocket,
    table: Mutex<PeerTable>,
    self_pid: ProcessId,
    buffer_size: usize,
}

impl Transport {
    /// Binds the endpoint described by `bootstrap` and derives all peer keys
    /// up front (derivation is deliberately slow).
    pub async fn bind(bootstrap: &Bootstrap) -> Result<Self, TransportError> {
        let (host, port) = bootstrap.bind_endpoint();
        let socket = UdpSocket::bind((host.as_str(), port)).await?;
        tracing::info!(pid = %bootstrap.process_id, %port, "transport bound");
        Ok(Self {
            socket,
            table: Mutex::new(PeerTable::from_bootstrap(bootstrap)),
            self_pid: bootstrap.process_id,
            buffer_size: bootstrap.buffer_size,
        })
    }

    pub fn self_pid(&self) -> ProcessId {
        self.self_pid
    }

    /// The locally bound address (useful when binding port 0 in tests).
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends one record to one peer. Failures (unknown peer, sealing,
    /// socket) are logged and swallowed.
    pub async fn send(&self, to: ProcessId, message: &Message) {
        if let Err(reason) = self.try_send(to, message).await {
            tracing::warn!(from = %self.self_pid, %to, kind = %message.kind, %reason,
                "dropping undeliverable datagram");
        }
    }

    async fn try_send(&self, to: ProcessId, message: &Message) -> Result<(), String> {
        let (addr, key) = {
            let table = self.table.lock().expect("peer table lock");
            let addr = table
                .addr_of(to)
                .ok_or_else(|| format!("no address for peer {to}"))?;
            let key = table
                .key_for(to)
                .copied()
                .ok_or_else(|| format!("no key for peer {to}"))?;
            (addr, key)
        };
        let plaintext = sievekv_wire::encode(message).map_err(|e| e.to_string())?;
        let sealed = sievekv_crypto::seal(&plaintext, &key);
        self.socket
            .send_to(&sealed, addr)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Fan-out to every known peer in `scope`, excluding self.
    pub async fn broadcast(&self, scope: Scope, message: &Message) {
        let targets: Vec<ProcessId> = {
            let table = self.table.lock().expect("peer table lock");
            table.peers_in(scope, self.self_pid)
        };
        for target in targets {
            self.send(target, message).await;
        }
    }

    /// Receives the next parseable record. Datagrams that cannot be
    /// attributed, opened or parsed are logged and skipped; only socket
    /// failures surface.
    pub async fn recv(&self) -> Result<(ProcessId, Message), TransportError> {
        let mut buf = BytesMut::zeroed(self.buffer_size);
        loop {
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            let datagram = &buf[..len];

            let (sender, key) = {
                let mut table = self.table.lock().expect("peer table lock");
                let sender = table.classify(addr);
                (sender, table.key_for(sender).copied())
            };
            let Some(key) = key else {
                tracing::warn!(%addr, %sender, "datagram from peer with no shared secret");
                continue;
            };
            let plaintext = match sievekv_crypto::open(datagram, &key) {
                Ok(plaintext) => plaintext,
                Err(reason) => {
                    tracing::warn!(%addr, %sender, %reason, "dropping unopenable datagram");
                    continue;
                }
            };
            match sievekv_wire::decode(&plaintext) {
                Ok(message) => {
                    tracing::trace!(from = %sender, kind = %message.kind, "received");
                    return Ok((sender, message));
                }
                Err(reason) => {
                    tracing::warn!(%addr, %sender, %reason, "dropping unparseable record");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sievekv_types::Scalar;
    use sievekv_wire::MessageKind;

    async fn pair(base_port: u16) -> (Transport, Transport) {
        let a = Transport::bind(&Bootstrap::local(2, 1, base_port))
            .await
            .expect("bind a");
        let b = Transport::bind(&Bootstrap::local(2, 2, base_port))
            .await
            .expect("bind b");
        (a, b)
    }

    #[tokio::test]
    async fn replicas_exchange_sealed_records() {
        let (a, b) = pair(36_200).await;
        let message = Message::execute(
            sievekv_types::Epoch::ZERO,
            sievekv_types::Operation::new("a", 1),
        );

        a.send(ProcessId::new(2), &message).await;
        let (from, received) = b.recv().await.expect("recv");
        assert_eq!(from, ProcessId::new(1));
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn client_is_admitted_and_answered() {
        let replica = Transport::bind(&Bootstrap::local(1, 1, 36_300))
            .await
            .expect("bind replica");
        let client = Transport::bind(&Bootstrap::local_client(1, 1000, 36_300))
            .await
            .expect("bind client");

        client.send(ProcessId::new(1), &Message::start()).await;
        let (sender, hello) = replica.recv().await.expect("recv start");
        assert_eq!(hello.kind, MessageKind::Start);
        assert!(sender.is_client(), "client ports classify above the floor");

        // The learned address routes the reply, sealed under the shared
        // client secret.
        let reply = Message::request_value(Scalar::from("x"));
        replica.send(sender, &reply).await;
        let (from, received) = client.recv().await.expect("recv reply");
        assert_eq!(from, ProcessId::new(1));
        assert_eq!(received, reply);
    }

    #[tokio::test]
    async fn garbage_datagrams_are_skipped() {
        let (a, b) = pair(36_400).await;

        // Raw noise straight at b's socket, then a valid record.
        let noise = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let b_addr = format!("127.0.0.1:{}", 36_400 + 2);
        noise.send_to(b"not a sealed record", &b_addr).await.expect("send noise");

        let message = Message::close();
        a.send(ProcessId::new(2), &message).await;

        let (_, received) = b.recv().await.expect("recv");
        assert_eq!(received, message);
    }
}
