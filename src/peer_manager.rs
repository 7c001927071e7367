//! Live peer registry.
//!
//! The peer manager exclusively owns the `address → peer` map (plus the
//! reverse `public address → address` map) and runs two loops per peer: a
//! heartbeat that converts persistent ping failure into a disconnect, and
//! a periodic announce that keeps our signed entry fresh on the other side.
//! Both loops exit on their next tick once the peer leaves the map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::address::Address;
use crate::config::Config;
use crate::error::{Result, ZifError};
use crate::node::LocalPeer;
use crate::peer::Peer;

pub struct PeerManager {
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    public_to_zif: RwLock<HashMap<String, Address>>,
    heartbeat: Duration,
    announce: Duration,
    max_peers: usize,
}

impl PeerManager {
    pub fn new(config: &Config) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            public_to_zif: RwLock::new(HashMap::new()),
            heartbeat: Duration::from_secs(config.net.heartbeat_secs),
            announce: Duration::from_secs(config.net.announce_mins * 60),
            max_peers: config.net.max_peers,
        }
    }

    pub fn count(&self) -> usize {
        self.peers.read().expect("peer map poisoned").len()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer map poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, addr: &Address) -> Option<Arc<Peer>> {
        self.peers.read().expect("peer map poisoned").get(addr).cloned()
    }

    pub fn get_by_public(&self, public: &str) -> Option<Arc<Peer>> {
        let addr = {
            let map = self.public_to_zif.read().expect("public map poisoned");
            map.get(public).copied()?
        };
        self.get(&addr)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.peers.read().expect("peer map poisoned").contains_key(addr)
    }

    /// Register a connected peer and spawn its loops. Returns the peer
    /// already registered under that address when there is one; connecting
    /// twice is idempotent.
    pub fn register(
        &self,
        lp: &Arc<LocalPeer>,
        peer: Arc<Peer>,
        public: Option<String>,
    ) -> Result<Arc<Peer>> {
        let addr = peer.address();

        {
            let mut peers = self.peers.write().expect("peer map poisoned");
            if let Some(existing) = peers.get(&addr) {
                return Ok(existing.clone());
            }
            if peers.len() >= self.max_peers {
                warn!(%addr, "peer limit reached, refusing connection");
                return Err(ZifError::PeerUnreachable);
            }
            peers.insert(addr, peer.clone());
        }

        if let Some(public) = public {
            self.public_to_zif
                .write()
                .expect("public map poisoned")
                .insert(public, addr);
        }

        info!(%addr, peers = self.count(), "peer registered");

        tokio::spawn(heartbeat_loop(lp.clone(), peer.clone()));
        tokio::spawn(announce_loop(lp.clone(), peer.clone()));

        Ok(peer)
    }

    /// Drop a peer from both maps. The peer's loops observe the absence on
    /// their next tick and exit.
    pub fn remove(&self, addr: &Address) {
        let removed = self
            .peers
            .write()
            .expect("peer map poisoned")
            .remove(addr)
            .is_some();

        if removed {
            self.public_to_zif
                .write()
                .expect("public map poisoned")
                .retain(|_, v| v != addr);
            info!(%addr, "peer removed");
        }
    }

    pub async fn close_all(&self) {
        for peer in self.peers() {
            peer.close().await;
        }
        self.peers.write().expect("peer map poisoned").clear();
        self.public_to_zif.write().expect("public map poisoned").clear();
    }
}

/// Ping the peer once per heartbeat period, with the period itself as the
/// deadline. One failure is a disconnect.
async fn heartbeat_loop(lp: Arc<LocalPeer>, peer: Arc<Peer>) {
    let period = lp.peers().heartbeat;
    let addr = peer.address();

    loop {
        tokio::time::sleep(period).await;

        if !lp.peers().contains(&addr) {
            return;
        }

        debug!(peer = %addr, "sending heartbeat");
        if let Err(e) = peer.ping(period).await {
            info!(peer = %addr, error = %e, "peer has no heartbeat, terminating");
            lp.handle_close(&addr).await;
            return;
        }
    }
}

/// Announce our signed entry right away, then once per announce period.
/// Errors are logged and the loop continues; disconnection ends it.
async fn announce_loop(lp: Arc<LocalPeer>, peer: Arc<Peer>) {
    let period = lp.peers().announce;
    let addr = peer.address();

    loop {
        if !lp.peers().contains(&addr) {
            return;
        }

        info!(peer = %addr, "announcing to peer");
        lp.sign_entry();
        if let Err(e) = peer.announce(&lp.entry()).await {
            warn!(peer = %addr, error = %e, "announce failed");
        }

        tokio::time::sleep(period).await;
    }
}
