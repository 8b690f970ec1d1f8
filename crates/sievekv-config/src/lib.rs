//! Cluster bootstrap configuration.
//!
//! A replica learns its world from environment variables at startup:
//! `N_PROCESSES`, `BUFFER_SIZE`, `PROCESS_ID`, `FAULTY`, and one `KEYn`
//! shared secret per peer `n != self` (plus the optional `KEY1000` client
//! secret). Hostnames follow the `process<n>` convention with ports
//! `8000 + n`. Membership is fixed at startup; there is no dynamic topology.
//!
//! Tests bypass the environment entirely through [`Bootstrap::local`].

use std::collections::BTreeMap;
use std::env;

use serde::{Deserialize, Serialize};

use sievekv_types::{CLIENT_ID_FLOOR, ProcessId};

/// Replicas listen on `REPLICA_PORT_BASE + process_id`.
pub const REPLICA_PORT_BASE: u16 = 8000;

/// Default datagram buffer when `BUFFER_SIZE` is absent from a builder.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Bootstrap configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("set the {0} environment variable")]
    Missing(String),

    #[error("environment variable {var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("PROCESS_ID {0} is outside 1..=N_PROCESSES")]
    ProcessIdOutOfRange(u64),
}

/// Where a peer listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub host: String,
    pub port: u16,
}

/// Everything a replica (or client) needs to join the cluster: identity,
/// topology and the symmetric key table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Total replica count `N`.
    pub n_processes: usize,

    /// This process's id.
    pub process_id: ProcessId,

    /// Maximum datagram size.
    pub buffer_size: usize,

    /// Nonzero marks this replica faulty for simulation.
    pub faulty: u64,

    /// Replica topology: id → listening endpoint.
    pub peers: BTreeMap<ProcessId, PeerSpec>,

    /// Per-peer shared secrets (`KEYn`). May also carry explicit client ids.
    pub secrets: BTreeMap<ProcessId, String>,

    /// Shared secret used for any client id without an explicit entry.
    pub client_secret: Option<String>,

    /// Port this process binds.
    pub bind_port: u16,
}

impl Bootstrap {
    /// Reads the bootstrap from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let n_processes = required_parsed::<usize>("N_PROCESSES")?;
        let buffer_size = required_parsed::<usize>("BUFFER_SIZE")?;
        let process_id = required_parsed::<u64>("PROCESS_ID")?;
        let faulty = required_parsed::<u64>("FAULTY")?;

        if process_id == 0 || process_id > n_processes as u64 {
            return Err(ConfigError::ProcessIdOutOfRange(process_id));
        }
        let process_id = ProcessId::new(process_id);

        let mut peers = BTreeMap::new();
        let mut secrets = BTreeMap::new();
        for n in 1..=n_processes as u64 {
            let pid = ProcessId::new(n);
            peers.insert(
                pid,
                PeerSpec {
                    host: format!("process{n}"),
                    port: REPLICA_PORT_BASE + n as u16,
                },
            );
            if pid != process_id {
                secrets.insert(pid, required(&format!("KEY{n}"))?);
            }
        }

        // The well-known client secret is optional: a replica without it
        // simply cannot decrypt client traffic.
        let client_secret = env::var(format!("KEY{CLIENT_ID_FLOOR}")).ok();

        Ok(Self {
            n_processes,
            process_id,
            buffer_size,
            faulty,
            peers,
            secrets,
            client_secret,
            bind_port: REPLICA_PORT_BASE + process_id.as_u64() as u16,
        })
    }

    /// A loopback cluster layout for tests and single-host runs: replica `n`
    /// listens on `127.0.0.1:base_port + n`. Pair secrets are derived from
    /// the canonical id pair, so both ends of a link agree; every
    /// client↔replica link shares the single client secret.
    pub fn local(n_processes: usize, process_id: u64, base_port: u16) -> Self {
        let process_id = ProcessId::new(process_id);
        let mut peers = BTreeMap::new();
        let mut secrets = BTreeMap::new();
        for n in 1..=n_processes as u64 {
            let pid = ProcessId::new(n);
            peers.insert(
                pid,
                PeerSpec {
                    host: "127.0.0.1".to_string(),
                    port: base_port + n as u16,
                },
            );
            if pid != process_id {
                secrets.insert(pid, local_pair_secret(process_id, pid));
            }
        }
        Self {
            n_processes,
            process_id,
            buffer_size: DEFAULT_BUFFER_SIZE,
            faulty: 0,
            peers,
            secrets,
            client_secret: Some(CLIENT_ID_FLOOR.to_string()),
            bind_port: base_port + process_id.as_u64() as u16,
        }
    }

    /// A loopback bootstrap for a client process: same replica topology as
    /// [`Bootstrap::local`], bound on `base_port + client_id`, with the
    /// shared client secret on every replica link.
    pub fn local_client(n_processes: usize, client_id: u64, base_port: u16) -> Self {
        let mut boot = Self::local(n_processes, client_id, base_port);
        let client_secret = CLIENT_ID_FLOOR.to_string();
        for secret in boot.secrets.values_mut() {
            *secret = client_secret.clone();
        }
        boot
    }

    /// The Byzantine fault bound for this cluster size.
    pub fn fault_bound(&self) -> usize {
        sievekv_types::fault_bound(self.n_processes)
    }

    /// Where this process should bind.
    pub fn bind_endpoint(&self) -> (String, u16) {
        ("0.0.0.0".to_string(), self.bind_port)
    }

    /// The sealing secret for the link to `pid`: the explicit `KEYn` pair
    /// secret, or the shared client secret for client peers. A link's secret
    /// covers both directions.
    pub fn secret_for(&self, pid: ProcessId) -> Option<&str> {
        self.secrets
            .get(&pid)
            .map(String::as_str)
            .or(if pid.is_client() {
                self.client_secret.as_deref()
            } else {
                None
            })
    }
}

/// Canonical pair secret for loopback clusters: both ends render the same
/// `lo:hi` pair.
fn local_pair_secret(a: ProcessId, b: ProcessId) -> String {
    let (lo, hi) = if a.as_u64() <= b.as_u64() {
        (a, b)
    } else {
        (b, a)
    };
    format!("{lo}:{hi}")
}

fn required(var: &str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var.to_string()))
}

fn required_parsed<T>(var: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = required(var)?;
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var: var.to_string(),
        value: raw,
        reason: e.to_string(),
    })
}

#[cfg(test)]
// Mutating the process environment needs `unsafe` on edition 2024.
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn local_layout_covers_all_peers() {
        let boot = Bootstrap::local(7, 3, 20_000);
        assert_eq!(boot.n_processes, 7);
        assert_eq!(boot.fault_bound(), 2);
        assert_eq!(boot.peers.len(), 7);
        assert_eq!(boot.secrets.len(), 6, "no secret for self");
        assert_eq!(
            boot.peers.get(&ProcessId::new(5)).map(|p| p.port),
            Some(20_005)
        );
    }

    #[test]
    fn pair_secrets_agree_across_the_link() {
        let one = Bootstrap::local(4, 1, 20_000);
        let three = Bootstrap::local(4, 3, 20_000);
        assert_eq!(
            one.secret_for(ProcessId::new(3)),
            three.secret_for(ProcessId::new(1)),
            "both ends of a replica link must derive the same key"
        );
        assert_ne!(
            one.secret_for(ProcessId::new(2)),
            one.secret_for(ProcessId::new(3))
        );
    }

    #[test]
    fn secret_lookup_falls_back_for_clients() {
        let boot = Bootstrap::local(4, 1, 20_000);
        let client = Bootstrap::local_client(4, 1000, 20_000);
        // No explicit entry for a transient client id: the shared client
        // secret serves, and it matches what clients seal with.
        assert_eq!(boot.secret_for(ProcessId::new(10_001)), Some("1000"));
        assert_eq!(client.secret_for(ProcessId::new(1)), Some("1000"));
        // Unknown replica ids never fall back.
        assert_eq!(boot.secret_for(ProcessId::new(99)), None);
    }

    #[test]
    fn bind_endpoint_uses_own_port() {
        let boot = Bootstrap::local(4, 2, 20_000);
        assert_eq!(boot.bind_endpoint(), ("0.0.0.0".to_string(), 20_002));
    }

    // Environment-variable loading is exercised in one serial test to avoid
    // cross-test env races.
    #[test]
    fn from_env_round_trip() {
        let vars = [
            ("N_PROCESSES", "4"),
            ("BUFFER_SIZE", "2048"),
            ("PROCESS_ID", "2"),
            ("FAULTY", "0"),
            ("KEY1", "alpha"),
            ("KEY3", "gamma"),
            ("KEY4", "delta"),
            ("KEY1000", "client"),
        ];
        for (k, v) in vars {
            unsafe { env::set_var(k, v) };
        }

        let boot = Bootstrap::from_env().expect("load");
        assert_eq!(boot.n_processes, 4);
        assert_eq!(boot.process_id, ProcessId::new(2));
        assert_eq!(boot.secret_for(ProcessId::new(1)), Some("alpha"));
        assert_eq!(boot.secret_for(ProcessId::new(1000)), Some("client"));
        assert_eq!(
            boot.peers.get(&ProcessId::new(4)).map(|p| p.host.clone()),
            Some("process4".to_string())
        );

        unsafe { env::remove_var("KEY1") };
        let err = Bootstrap::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(v) if v == "KEY1"));

        for (k, _) in vars {
            unsafe { env::remove_var(k) };
        }
    }
}
