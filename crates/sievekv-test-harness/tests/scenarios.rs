//! End-to-end cluster scenarios over real sockets.
//!
//! Each test brings up a fresh N = 7 (f = 2) loopback cluster with
//! compressed timers. Base ports are spaced 2000 apart so replica and client
//! endpoints never collide across concurrently running tests.

use std::time::Duration;

use sievekv_test_harness::TestCluster;
use sievekv_types::ProcessId;
use sievekv_wire::{DelayProfile, MessageKind};

/// Generous ceiling for a single protocol round under compressed timers.
const ROUND: Duration = Duration::from_secs(10);

/// Ceiling for liveness scenarios (complaint, epoch change).
const LIVENESS: Duration = Duration::from_secs(25);

#[tokio::test(flavor = "multi_thread")]
async fn commit_then_read_from_every_replica() {
    let cluster = TestCluster::start(7, 40_000).await.expect("cluster");
    let client = cluster.client().await.expect("client");
    client.set_ex_time(DelayProfile::NEVER_SLOW).await;

    client.invoke("a", 1).await;
    let (_, commit) = client
        .await_message(ROUND, |m| m.kind == MessageKind::Commit)
        .await
        .expect("terminal COMMIT");
    assert_eq!(commit.generic_data, Some(serde_json::json!(["a", 1])));

    // Read-your-writes from every replica: each answers from its own
    // dictionary.
    for pid in 1..=7u64 {
        client
            .request_value_from(ProcessId::new(pid), "a")
            .await;
        let (from, reply) = client
            .await_message(ROUND, |m| m.kind == MessageKind::RequestValue)
            .await
            .unwrap_or_else(|| panic!("replica {pid} answered the read"));
        assert_eq!(from, ProcessId::new(pid));
        assert_eq!(reply.generic_data, Some(serde_json::json!(["a", 1])));
    }

    cluster.shutdown(&client).await;
    client.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn faulty_majority_aborts_and_leaves_no_trace() {
    let cluster = TestCluster::start(7, 42_000).await.expect("cluster");
    let client = cluster.client().await.expect("client");
    client.set_ex_time(DelayProfile::NEVER_SLOW).await;

    // Five of seven mangle their responses with distinct suffixes: no digest
    // group can exceed f = 2.
    for pid in 3..=7u64 {
        client.set_faulty(ProcessId::new(pid), 100).await;
    }

    client.invoke("a", 1).await;
    let (_, abort) = client
        .await_message(ROUND, |m| m.kind == MessageKind::Abort)
        .await
        .expect("terminal ABORT");
    assert_eq!(abort.generic_data, Some(serde_json::json!(["a", 1])));

    // The aborted write must not be visible anywhere.
    client.request_value_from(ProcessId::new(1), "a").await;
    let (_, reply) = client
        .await_message(ROUND, |m| m.kind == MessageKind::RequestValue)
        .await
        .expect("read after abort");
    assert_eq!(reply.generic_data, Some(serde_json::json!(["a", null])));

    cluster.shutdown(&client).await;
    client.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn complaint_changes_leader_then_cluster_recovers() {
    let cluster = TestCluster::start(7, 44_000).await.expect("cluster");
    let client = cluster.client().await.expect("client");

    // Every execution takes the slow path; the leader cannot finish a round
    // before submitters' operations age out.
    client.set_ex_time(DelayProfile::ALWAYS_SLOW).await;
    for via in [2u64, 3, 4] {
        client.invoke_via(ProcessId::new(via), "a", via as i64).await;
    }

    let (_, handover) = client
        .await_message(LIVENESS, |m| m.kind == MessageKind::NewSieveConfig)
        .await
        .expect("terminal NEW_SIEVE_CONFIG");
    let payload = handover.generic_data.expect("handover payload");
    let new_leader = payload[0].as_u64().expect("leader id");
    assert_ne!(new_leader, 1, "leadership must leave the initial leader");

    // Recovery: with delays off, a fresh submission commits in the new
    // epoch.
    client.set_ex_time(DelayProfile::NEVER_SLOW).await;
    client.invoke_via(ProcessId::new(1), "b", 2).await;
    let (_, commit) = client
        .await_message(LIVENESS, |m| {
            m.kind == MessageKind::Commit
                && m.generic_data == Some(serde_json::json!(["b", 2]))
        })
        .await
        .expect("COMMIT in the new epoch");
    assert!(
        commit.config.expect("epoch").as_u64() >= 1,
        "commit must land after the epoch change"
    );

    cluster.shutdown(&client).await;
    client.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn second_submission_through_same_replica_is_not_queued() {
    let cluster = TestCluster::start(7, 46_000).await.expect("cluster");
    let client = cluster.client().await.expect("client");
    client.set_ex_time(DelayProfile::ALWAYS_SLOW).await;

    // Two quick submissions through replica 6: the leader keeps one slot per
    // submitter, so the second waits in replica 6's queue until it ages out.
    client.invoke_via(ProcessId::new(6), "a", 1).await;
    client.invoke_via(ProcessId::new(6), "b", 2).await;

    let (_, not_queued) = client
        .await_message(LIVENESS, |m| m.kind == MessageKind::OperationNotQueued)
        .await
        .expect("OPERATION_NOT_QUEUED for the second submission");
    assert_eq!(
        not_queued.generic_data,
        Some(serde_json::json!(["b", 2]))
    );

    cluster.shutdown(&client).await;
    client.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn two_clients_commit_distinct_keys() {
    let cluster = TestCluster::start(7, 48_000).await.expect("cluster");
    let first = cluster.client().await.expect("first client");
    let second = cluster.client_with_id(1001).await.expect("second client");
    first.set_ex_time(DelayProfile::NEVER_SLOW).await;

    // Distinct submitters so neither collides with the other's leader slot.
    first.invoke_via(ProcessId::new(2), "a", 1).await;
    second.invoke_via(ProcessId::new(3), "b", 2).await;

    let (_, commit_a) = first
        .await_message(ROUND, |m| m.kind == MessageKind::Commit)
        .await
        .expect("first client's COMMIT");
    assert_eq!(commit_a.generic_data, Some(serde_json::json!(["a", 1])));

    let (_, commit_b) = second
        .await_message(ROUND, |m| m.kind == MessageKind::Commit)
        .await
        .expect("second client's COMMIT");
    assert_eq!(commit_b.generic_data, Some(serde_json::json!(["b", 2])));

    cluster.shutdown(&first).await;
    first.shutdown();
    second.shutdown();
}
