//! Shared helpers for integration tests: bring up full nodes on loopback
//! with fast heartbeats and throwaway data directories.

use std::net::SocketAddr;
use std::sync::Arc;

use tempfile::TempDir;
use zif::{Config, LocalPeer, MemoryCatalog, Post, TcpDialer};

pub struct TestNode {
    pub node: Arc<LocalPeer>,
    pub addr: SocketAddr,
    // Held so the data directory outlives the node
    _dir: TempDir,
}

impl TestNode {
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

pub async fn spawn_node(name: &str) -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = Config::default();
    config.net.heartbeat_secs = 1;

    let node = LocalPeer::new(
        config,
        dir.path(),
        Arc::new(MemoryCatalog::new()),
        Box::new(TcpDialer),
    )
    .expect("node setup");

    node.local_set("name", name).expect("set name");
    node.local_set("public", "127.0.0.1").expect("set public");

    let addr = node.listen("127.0.0.1:0").await.expect("listen");

    TestNode {
        node,
        addr,
        _dir: dir,
    }
}

#[allow(dead_code)]
pub fn post(i: i64) -> Post {
    Post {
        id: i,
        info_hash: format!("infohash-{i:08}"),
        title: format!("post number {i}"),
        size: 1024 + i,
        file_count: 1,
        seeders: i % 50,
        leechers: i % 7,
        upload_date: 1_500_000_000 + i,
        tags: "test,data".into(),
        meta: String::new(),
    }
}
