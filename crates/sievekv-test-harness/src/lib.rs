//! In-process cluster bring-up for end-to-end tests.
//!
//! Spawns N replica runtimes on loopback ports and hands out connected
//! clients. Protocol timers are compressed by default so liveness scenarios
//! (complaints, leader changes) finish in seconds; semantics are unchanged,
//! only the scale.

use std::time::Duration;

use sievekv_client::Client;
use sievekv_config::Bootstrap;
use sievekv_rsm::Timing;
use sievekv_server::{Replica, RuntimeConfig};
use sievekv_types::CLIENT_ID_FLOOR;

/// Timer compression factor for tests: 4 s / 7 s / 3 s become 1 s / 1.75 s /
/// 0.75 s.
pub const TIMER_COMPRESSION: u32 = 4;

/// A running loopback cluster.
pub struct TestCluster {
    replicas: Vec<Replica>,
    n: usize,
    base_port: u16,
}

impl TestCluster {
    /// Starts an N-replica cluster on `base_port + 1 ..= base_port + n`,
    /// with compressed timers. Tests must pick base ports at least 2000
    /// apart so client endpoints (`base_port + 1000 + ...`) never collide.
    pub async fn start(n: usize, base_port: u16) -> anyhow::Result<Self> {
        let runtime = RuntimeConfig::with_timing(Timing::scaled_down(TIMER_COMPRESSION));
        Self::start_with(n, base_port, runtime).await
    }

    /// Starts a cluster with an explicit runtime configuration.
    pub async fn start_with(
        n: usize,
        base_port: u16,
        runtime: RuntimeConfig,
    ) -> anyhow::Result<Self> {
        let mut replicas = Vec::with_capacity(n);
        for pid in 1..=n as u64 {
            let bootstrap = Bootstrap::local(n, pid, base_port);
            replicas.push(Replica::spawn(&bootstrap, runtime).await?);
        }
        tracing::info!(n, base_port, "test cluster up");
        Ok(Self {
            replicas,
            n,
            base_port,
        })
    }

    /// The compressed timing in effect, for computing waits in tests.
    pub fn timing(&self) -> Timing {
        Timing::scaled_down(TIMER_COMPRESSION)
    }

    /// Connects the well-known operator client.
    pub async fn client(&self) -> anyhow::Result<Client> {
        self.client_with_id(CLIENT_ID_FLOOR).await
    }

    /// Connects an additional client on a fresh endpoint.
    pub async fn client_with_id(&self, client_id: u64) -> anyhow::Result<Client> {
        let bootstrap = Bootstrap::local_client(self.n, client_id, self.base_port);
        Ok(Client::connect(&bootstrap).await?)
    }

    /// Drives the cluster to CLOSING via the client, then reaps stragglers.
    pub async fn shutdown(self, client: &Client) {
        client.close_cluster().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        for replica in self.replicas {
            replica.abort();
        }
    }
}
