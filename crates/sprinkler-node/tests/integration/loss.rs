//! Lossy medium tests -- dropped datagrams, partitions and garbage.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use sprinkler_node::transport::Transport;
use sprinkler_protocol::MessageKind;

use crate::harness::{test_file, TestMesh};

/// Offset of the kind byte, after the magic.
const KIND_OFFSET: usize = 4;

fn is_data(datagram: &Bytes) -> bool {
    datagram.get(KIND_OFFSET) == Some(&(MessageKind::Data as u8))
}

/// Every other Data datagram to each receiver is lost.
#[tokio::test]
async fn test_completes_with_half_of_data_dropped() {
    let mesh = TestMesh::new(3).unwrap();
    let mut per_receiver: HashMap<usize, u64> = HashMap::new();
    mesh.network.set_filter(Box::new(move |_, to, datagram: &Bytes| {
        if !is_data(datagram) {
            return false;
        }
        let n = per_receiver.entry(to).or_insert(0);
        *n += 1;
        *n % 2 == 0
    }));

    let data = test_file(12_000, 11);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.wait_all_received(1, &data, Duration::from_secs(30))
        .await
        .unwrap();

    let (_, dropped) = mesh.network.counters();
    assert!(dropped > 0);
    mesh.shutdown_all().await;
}

/// Control traffic is lossy too; beacons are retried by Trickle.
#[tokio::test]
async fn test_completes_with_random_loss_on_both_channels() {
    let mesh = TestMesh::new(3).unwrap();
    let mut state: u64 = 0x2545_F491_4F6C_DD1D;
    mesh.network.set_filter(Box::new(move |_, _, _: &Bytes| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        // About 30% loss
        state % 10 < 3
    }));

    let data = test_file(8_000, 12);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.wait_all_received(1, &data, Duration::from_secs(40))
        .await
        .unwrap();
    mesh.shutdown_all().await;
}

/// Node 2 cannot hear the seeder; node 1 relays once it completes.
#[tokio::test]
async fn test_relay_reaches_partitioned_node() {
    let mesh = TestMesh::with_builder(3, |_, b| b.relay(true)).unwrap();
    mesh.network
        .partition(mesh.nodes[0].transport_id, mesh.nodes[2].transport_id);

    let data = test_file(6_000, 13);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.wait_all_received(1, &data, Duration::from_secs(40))
        .await
        .unwrap();

    let relay = mesh.nodes[1].status().await.unwrap();
    assert!(relay.stats.symbols_sent > 0, "node 1 never relayed");
    mesh.shutdown_all().await;
}

/// Without relaying, a partitioned node never completes.
#[tokio::test]
async fn test_partitioned_node_starves_without_relay() {
    let mesh = TestMesh::new(3).unwrap();
    mesh.network
        .partition(mesh.nodes[0].transport_id, mesh.nodes[2].transport_id);

    let data = test_file(4_000, 14);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.nodes[1]
        .wait_transfer(1, Duration::from_secs(20))
        .await
        .unwrap();

    assert!(mesh.nodes[2]
        .wait_transfer(1, Duration::from_secs(3))
        .await
        .is_err());
    mesh.shutdown_all().await;
}

/// Garbage on the group is dropped by the listener and changes nothing.
#[tokio::test]
async fn test_malformed_datagrams_ignored() {
    let mesh = TestMesh::new(2).unwrap();
    let noise = mesh.network.join(2_048);
    for i in 0..50u8 {
        noise.send(Bytes::from(vec![i; 40])).await.unwrap();
    }
    // Right magic, unknown kind
    noise
        .send(Bytes::from_static(&[0x53, 0x50, 0x52, 0x4B, 0x7F, 0, 0]))
        .await
        .unwrap();

    let data = test_file(5_000, 15);
    mesh.nodes[0].publish(1, &data).await.unwrap();
    mesh.wait_all_received(1, &data, Duration::from_secs(20))
        .await
        .unwrap();
    mesh.shutdown_all().await;
}
