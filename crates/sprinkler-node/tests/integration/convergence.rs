//! Transfer convergence over a lossless in-memory medium.

use std::time::Duration;

use sprinkler_dissemination::{SessionEvent, SessionState};
use sprinkler_protocol::PeerStatus;

use crate::harness::{
    build_test_runtime, scaled_timeout, test_file, test_node_count, TestMesh, TestNodeBuilder,
};

/// One seeder, one receiver.
#[tokio::test]
async fn test_two_node_transfer() {
    let mesh = TestMesh::new(2).unwrap();
    let data = test_file(10_000, 1);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.wait_all_received(1, &data, Duration::from_secs(20))
        .await
        .unwrap();

    mesh.nodes[1]
        .wait_state(1, SessionState::Complete, Duration::from_secs(5))
        .await
        .unwrap();
    let status = mesh.nodes[1].status().await.unwrap();
    assert_eq!(status.peer_status, PeerStatus::Holding);
    mesh.shutdown_all().await;
}

/// N nodes all complete. Default 4, override with TEST_NODE_COUNT.
#[test]
fn test_n_node_convergence() {
    build_test_runtime(4).block_on(async {
        let n = test_node_count(4);
        let mesh = TestMesh::new(n).unwrap();
        let data = test_file(20_000, 2);
        mesh.nodes[0].publish(1, &data).await.unwrap();
        mesh.wait_all_received(1, &data, scaled_timeout(n, 30))
            .await
            .unwrap();
        mesh.shutdown_all().await;
    });
}

/// A newer version published mid-transfer replaces the old one everywhere.
#[tokio::test]
async fn test_newer_version_supersedes() {
    let mesh = TestMesh::new(3).unwrap();
    let v1 = test_file(200_000, 3);
    mesh.nodes[0].publish(1, &v1).await.unwrap();
    for node in &mesh.nodes[1..] {
        node.wait_state(1, SessionState::Transmitting, Duration::from_secs(10))
            .await
            .unwrap();
    }

    let v2 = test_file(8_000, 4);
    mesh.nodes[0].publish(2, &v2).await.unwrap();
    mesh.wait_all_received(2, &v2, Duration::from_secs(30))
        .await
        .unwrap();

    for node in &mesh.nodes[1..] {
        let events = node.seen_events().await;
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SessionEvent::Completed(t) if t.version == 1)),
            "{} completed the superseded version",
            node.handle.name()
        );
    }
    mesh.shutdown_all().await;
}

/// A node that joins after everyone converged still gets the file.
#[tokio::test]
async fn test_late_joiner() {
    let mut mesh = TestMesh::new(3).unwrap();
    let data = test_file(6_000, 5);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.wait_all_received(1, &data, Duration::from_secs(20))
        .await
        .unwrap();

    let late = TestNodeBuilder::new("node-late").build(&mesh.network).unwrap();
    let transfer = late.wait_transfer(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(transfer.file_bytes().as_ref(), data.as_slice());
    mesh.nodes.push(late);
    mesh.shutdown_all().await;
}

/// A seeder waiting for interest starts as soon as a receiver asks.
#[tokio::test]
async fn test_await_interest_seeder_answers_demand() {
    let mesh = TestMesh::with_builder(2, |i, b| b.await_interest(i == 0)).unwrap();
    let data = test_file(4_000, 6);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.wait_all_received(1, &data, Duration::from_secs(20))
        .await
        .unwrap();
    mesh.shutdown_all().await;
}

/// Status serialises to JSON with the fields operators read.
#[tokio::test]
async fn test_status_json() {
    let mesh = TestMesh::new(2).unwrap();
    let data = test_file(3_000, 7);
    mesh.nodes[0].publish(1, &data).await.unwrap();

    let status = mesh.nodes[0].status().await.unwrap();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["session"]["version"], 1);
    assert_eq!(json["session"]["role"], "seeder");
    assert!(json["control"]["interval_ms"].as_u64().is_some());
    assert!(json["stats"]["symbols_sent"].is_u64());
    mesh.shutdown_all().await;
}

/// Stopping a session silences the node until it is started again.
#[tokio::test]
async fn test_stop_session_goes_quiet() {
    let mesh = TestMesh::new(2).unwrap();
    let data = test_file(3_000, 8);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.nodes[0].handle.stop_session().await.unwrap();

    let status = mesh.nodes[0].status().await.unwrap();
    assert_eq!(status.session.as_ref().unwrap().state, SessionState::Aborted);
    assert!(!status.control.running);
    assert!(!status.data.running);

    let seeder_sent = status.stats.symbols_sent;
    tokio::time::sleep(Duration::from_millis(500)).await;
    // The receiver keeps asking; a stopped seeder does not answer.
    assert_eq!(
        mesh.nodes[0].status().await.unwrap().stats.symbols_sent,
        seeder_sent
    );

    mesh.nodes[0].handle.start().await.unwrap();
    assert!(mesh.nodes[0].status().await.unwrap().control.running);
    mesh.shutdown_all().await;
}
