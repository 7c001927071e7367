//! Two-node protocol tests: handshake, DHT queries, announce semantics,
//! post pages and seed registration over real loopback connections.

mod common;

use std::time::Duration;

use common::{post, spawn_node};
use tokio::time::timeout;
use zif::{Command, CommandResult};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn handshake_stores_peer_entries_both_sides() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        let peer = b.node.connect_direct(&a.host()).await.expect("connect");
        assert_eq!(peer.address(), a.node.address());

        // Both ends learned the other's entry during the handshake
        assert!(b.node.dht().has(&a.node.address()));
        assert!(a.node.dht().has(&b.node.address()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn connect_is_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        let first = b.node.connect_direct(&a.host()).await.expect("connect");
        let second = b.node.connect_direct(&a.host()).await.expect("reconnect");
        assert_eq!(first.address(), second.address());
        assert_eq!(b.node.peers().count(), 1);

        // By-address connect also returns the live peer
        let third = b.node.connect(a.node.address()).await.expect("by address");
        assert_eq!(third.address(), first.address());
        assert_eq!(b.node.peers().count(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn find_closest_returns_target_entry() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        let peer = b.node.connect_direct(&a.host()).await.expect("connect");
        let found = peer
            .find_closest(&a.node.address())
            .await
            .expect("find closest");

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, a.node.address());
        found[0].verify().expect("returned entry verifies");
        assert!(b.node.dht().has(&a.node.address()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transport_ping_round_trips() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        b.node.connect_direct(&a.host()).await.expect("connect");

        let result = b
            .node
            .dispatch(Command::Ping(a.node.address().encode()))
            .await
            .expect("ping");
        match result {
            CommandResult::Rtt(rtt) => assert!(rtt < Duration::from_secs(10)),
            other => panic!("unexpected result {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn announce_replaces_older_entry() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        let peer = a.node.connect_direct(&b.host()).await.expect("connect");

        a.node.sign_entry();
        peer.announce(&a.node.entry()).await.expect("announce v1");
        let stored = b.node.dht().query(&a.node.address()).unwrap().unwrap();
        let first_updated = stored.updated;

        // Mutate and re-sign; updated moves forward
        tokio::time::sleep(Duration::from_millis(1100)).await;
        a.node.local_set("desc", "second version").expect("set desc");
        peer.announce(&a.node.entry()).await.expect("announce v2");

        let stored = b.node.dht().query(&a.node.address()).unwrap().unwrap();
        assert_eq!(stored.desc, "second version");
        assert!(stored.updated > first_updated);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn recent_and_search_pages_come_back() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        for i in 0..30 {
            a.node.catalog().insert_post(post(i)).expect("insert");
        }
        a.node.rebuild_collection().expect("rebuild");

        let peer = b.node.connect_direct(&a.host()).await.expect("connect");

        let recent = peer.recent(0).await.expect("recent");
        assert_eq!(recent.len(), 25);
        assert_eq!(recent[0].id, 29);

        let hits = peer.search("post number 7", 0).await.expect("search");
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|p| p.title.contains("post number 7")));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn request_add_peer_registers_seed() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        let peer = b.node.connect_direct(&a.host()).await.expect("connect");
        peer.request_add_peer(&a.node.address())
            .await
            .expect("add peer");

        // A now lists B as one of its seeds
        let seeds = a.node.entry().seeds;
        assert!(seeds.contains(&b.node.address()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn protocol_ping_gets_a_pong() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        let peer = b.node.connect_direct(&a.host()).await.expect("connect");
        let mut client = peer.open_client().await.expect("open stream");
        client.ping().await.expect("pong");
        client.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn resolve_fails_for_unknown_address() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("node-a").await;
        let missing = zif::Address::random();
        assert!(a.node.resolve(missing).await.is_err());
    })
    .await
    .expect("test timed out");
}
