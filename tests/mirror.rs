//! Catalog mirroring: full download with piece verification, resume
//! bookkeeping, seed registration, and the integrity abort on tampering.

mod common;

use std::time::Duration;

use common::{post, spawn_node};
use tokio::time::timeout;
use zif::{ZifError, data::PIECE_SIZE};

const TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// 2.5 pieces worth of posts.
const POST_COUNT: usize = PIECE_SIZE * 2 + PIECE_SIZE / 2;

#[tokio::test]
async fn mirror_downloads_and_verifies_whole_catalog() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("publisher").await;
        let b = spawn_node("mirror").await;

        for i in 0..POST_COUNT {
            a.node.catalog().insert_post(post(i as i64)).expect("insert");
        }
        a.node.rebuild_collection().expect("rebuild");

        b.node.connect_direct(&a.host()).await.expect("connect");
        b.node.mirror(a.node.address()).await.expect("mirror");

        // Every post landed
        let store = b
            .node
            .store_for(&a.node.address())
            .expect("mirrored store exists");
        assert_eq!(store.post_count(), POST_COUNT);

        // Recomputed piece hashes match the publisher's signed list
        let ours = zif::Collection::build(store.as_ref(), PIECE_SIZE).expect("rehash");
        let theirs = a
            .node
            .collection_message(&a.node.address())
            .expect("publisher hash list");
        assert_eq!(ours.hash_list, theirs.hash_list);

        // Progress reached the last piece and completed
        let progress = b
            .node
            .mirror_progress(&a.node.address())
            .expect("progress tracked");
        assert!(progress.done);
        assert_eq!(progress.piece, 2);

        // Seed relationship registered on both sides
        assert!(a.node.entry().seeds.contains(&b.node.address()));
        assert!(b.node.entry().seeding.contains(&a.node.address()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mirror_aborts_on_tampered_piece() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("publisher").await;
        let b = spawn_node("mirror").await;

        for i in 0..POST_COUNT {
            a.node.catalog().insert_post(post(i as i64)).expect("insert");
        }
        a.node.rebuild_collection().expect("rebuild");

        // Corrupt one post inside piece 1 after the hash list was signed;
        // the served bytes no longer match the signed hashes.
        let tampered_id = (PIECE_SIZE + 10) as i64;
        a.node
            .catalog()
            .add_meta(tampered_id, "tampered")
            .expect("tamper");

        b.node.connect_direct(&a.host()).await.expect("connect");
        let err = b
            .node
            .mirror(a.node.address())
            .await
            .expect_err("mirror must abort");
        match err {
            ZifError::IntegrityMismatch { piece } => assert_eq!(piece, 1),
            other => panic!("expected integrity mismatch, got {other}"),
        }

        // Piece 0 was committed before the mismatch; piece 1 was not
        let store = b
            .node
            .store_for(&a.node.address())
            .expect("mirrored store exists");
        assert_eq!(store.post_count(), PIECE_SIZE);

        let progress = b
            .node
            .mirror_progress(&a.node.address())
            .expect("progress tracked");
        assert!(!progress.done);
        assert!(progress.error.is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mirrored_hash_list_is_served_onward() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node("publisher").await;
        let b = spawn_node("mirror").await;

        for i in 0..(PIECE_SIZE / 2) {
            a.node.catalog().insert_post(post(i as i64)).expect("insert");
        }
        a.node.rebuild_collection().expect("rebuild");

        b.node.connect_direct(&a.host()).await.expect("connect");
        b.node.mirror(a.node.address()).await.expect("mirror");

        // B can now serve A's hash list, with A's own signature
        let served = b
            .node
            .collection_message(&a.node.address())
            .expect("hash list for mirrored catalog");
        served
            .verify(&a.node.entry().public_key)
            .expect("owner signature still verifies");
    })
    .await
    .expect("test timed out");
}
