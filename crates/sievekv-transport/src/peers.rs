//! Peer identification and key table.

use std::collections::HashMap;
use std::net::SocketAddr;

use sievekv_config::{Bootstrap, REPLICA_PORT_BASE};
use sievekv_crypto::SealingKey;
use sievekv_types::{ProcessId, Scope, TRANSIENT_CLIENT_BASE};

/// Source ports above this are admitted as transient clients.
pub const TRANSIENT_PORT_FLOOR: u16 = 10_000;

/// Maps peers to addresses and sealing keys.
///
/// Replica peers come from the bootstrap topology; client peers are learned
/// from inbound traffic. Keys are derived once, here — PBKDF2 at 100k rounds
/// is far too slow for the datagram path.
pub struct PeerTable {
    addrs: HashMap<ProcessId, SocketAddr>,
    by_addr: HashMap<SocketAddr, ProcessId>,
    keys: HashMap<ProcessId, SealingKey>,
    client_key: Option<SealingKey>,
    next_transient: u64,
}

impl PeerTable {
    pub fn from_bootstrap(bootstrap: &Bootstrap) -> Self {
        let mut addrs = HashMap::new();
        let mut by_addr = HashMap::new();
        for (pid, spec) in &bootstrap.peers {
            if *pid == bootstrap.process_id {
                continue;
            }
            if let Ok(mut resolved) = std::net::ToSocketAddrs::to_socket_addrs(&(
                spec.host.as_str(),
                spec.port,
            )) {
                if let Some(addr) = resolved.next() {
                    addrs.insert(*pid, addr);
                    by_addr.insert(addr, *pid);
                }
            }
        }

        let keys = bootstrap
            .secrets
            .iter()
            .map(|(pid, secret)| (*pid, SealingKey::derive(secret)))
            .collect();
        let client_key = bootstrap
            .client_secret
            .as_deref()
            .map(SealingKey::derive);

        Self {
            addrs,
            by_addr,
            keys,
            client_key,
            next_transient: TRANSIENT_CLIENT_BASE,
        }
    }

    /// Identifies the sender of a datagram, admitting unknown sources:
    /// ports up to the transient floor map onto the `port - 8000` id
    /// convention, anything above is a transient client with a fresh id.
    pub fn classify(&mut self, addr: SocketAddr) -> ProcessId {
        if let Some(pid) = self.by_addr.get(&addr) {
            return *pid;
        }
        let pid = if addr.port() > TRANSIENT_PORT_FLOOR || addr.port() <= REPLICA_PORT_BASE {
            let pid = ProcessId::new(self.next_transient);
            self.next_transient += 1;
            pid
        } else {
            ProcessId::new(u64::from(addr.port() - REPLICA_PORT_BASE))
        };
        tracing::debug!(%addr, %pid, "admitting new peer");
        self.register(pid, addr);
        pid
    }

    /// Records (or moves) a peer's address.
    pub fn register(&mut self, pid: ProcessId, addr: SocketAddr) {
        if let Some(old) = self.addrs.insert(pid, addr) {
            self.by_addr.remove(&old);
        }
        self.by_addr.insert(addr, pid);
    }

    pub fn addr_of(&self, pid: ProcessId) -> Option<SocketAddr> {
        self.addrs.get(&pid).copied()
    }

    /// The sealing key for a link: the explicit pair key, or the shared
    /// client secret for client peers.
    pub fn key_for(&self, pid: ProcessId) -> Option<&SealingKey> {
        self.keys.get(&pid).or(if pid.is_client() {
            self.client_key.as_ref()
        } else {
            None
        })
    }

    /// Known peers inside `scope`, excluding `exclude`.
    pub fn peers_in(&self, scope: Scope, exclude: ProcessId) -> Vec<ProcessId> {
        let mut peers: Vec<ProcessId> = self
            .addrs
            .keys()
            .copied()
            .filter(|pid| scope.contains(*pid) && *pid != exclude)
            .collect();
        peers.sort_unstable();
        peers
    }
}
