//! Peer lifecycle: a dead peer is removed from the map within a bounded
//! number of heartbeat periods, and its loops stop with it.

mod common;

use std::time::Duration;

use common::spawn_node;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn dead_peer_is_removed_from_the_map() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("survivor").await;
        let b = spawn_node("casualty").await;

        b.node.connect_direct(&a.host()).await.expect("connect");
        assert_eq!(a.node.peers().count(), 1);
        assert_eq!(b.node.peers().count(), 1);

        // B goes away; A must notice within (heartbeat + detection) time.
        // Test nodes run a 1 second heartbeat.
        b.node.close().await;

        let mut waited = Duration::ZERO;
        while a.node.peers().count() != 0 && waited < Duration::from_secs(10) {
            tokio::time::sleep(Duration::from_millis(200)).await;
            waited += Duration::from_millis(200);
        }
        assert_eq!(a.node.peers().count(), 0, "peer not removed after close");

        // The map stays empty: heartbeat and announce loops have exited
        // rather than resurrecting the peer.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(a.node.peers().count(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn surviving_peer_stays_registered() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("one").await;
        let b = spawn_node("two").await;

        b.node.connect_direct(&a.host()).await.expect("connect");

        // Several heartbeat periods pass; a live peer must not be culled
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(a.node.peers().count(), 1);
        assert_eq!(b.node.peers().count(), 1);
    })
    .await
    .expect("test timed out");
}
