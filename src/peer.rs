//! A connected remote peer.
//!
//! [`Peer`] wraps the peer's multiplexed session with the operations the
//! rest of the node speaks in: announce, query, find-closest, post pages,
//! and the full mirror flow. Every operation pings first with a 10 second
//! deadline, so an unreachable peer fails fast instead of tying up a stream.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use crate::address::Address;
use crate::client::Client;
use crate::data::{CatalogStore, Collection, Post};
use crate::dht::Dht;
use crate::entry::Entry;
use crate::error::{Result, ZifError};
use crate::message::MessageCollection;
use crate::mux::Session;
use crate::stream::{StreamManager, TokenBucket};

/// Deadline for the ping that fronts every RPC.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Pieces fetched per request while mirroring.
const MIRROR_BATCH: usize = 8;

/// Per-peer request rate limits, applied by the server to inbound streams.
pub struct PeerLimiter {
    pub queries: Mutex<TokenBucket>,
    pub announces: Mutex<TokenBucket>,
}

impl PeerLimiter {
    fn new() -> Self {
        Self {
            queries: Mutex::new(TokenBucket::new(10.0, 20)),
            announces: Mutex::new(TokenBucket::new(0.1, 3)),
        }
    }
}

pub struct Peer {
    streams: StreamManager,
    entry: RwLock<Entry>,
    pub limiter: PeerLimiter,
}

impl Peer {
    pub fn new(streams: StreamManager) -> Arc<Peer> {
        let entry = streams.remote().clone();
        Arc::new(Peer {
            streams,
            entry: RwLock::new(entry),
            limiter: PeerLimiter::new(),
        })
    }

    pub fn address(&self) -> Address {
        self.streams.remote().address
    }

    pub fn public_key(&self) -> &[u8] {
        &self.streams.remote().public_key
    }

    pub fn session(&self) -> &Session {
        self.streams.session()
    }

    /// The entry presented at handshake, refreshed by [`Peer::refresh_entry`].
    pub async fn entry(&self) -> Entry {
        self.entry.read().await.clone()
    }

    pub async fn ping(&self, deadline: Duration) -> Result<Duration> {
        self.streams.ping(deadline).await
    }

    /// Ping, then open a fresh stream for one RPC.
    pub async fn open_client(&self) -> Result<Client> {
        self.ping(PING_TIMEOUT).await?;
        Ok(Client::new(self.streams.open_stream().await?))
    }

    /// Send a signed entry for the peer to store and propagate.
    pub async fn announce(&self, entry: &Entry) -> Result<()> {
        debug!(peer = %self.address(), "sending announce");
        let mut client = self.open_client().await?;
        let result = client.announce(entry).await;
        client.close().await;
        result
    }

    pub async fn query(&self, target: &Address) -> Result<Entry> {
        debug!(peer = %self.address(), target = %target, "querying");
        let mut client = self.open_client().await?;
        let result = client.query(target).await;
        client.close().await;
        result
    }

    pub async fn find_closest(&self, target: &Address) -> Result<Vec<Entry>> {
        debug!(peer = %self.address(), target = %target, "finding closest");
        let mut client = self.open_client().await?;
        let result = client.find_closest(target).await;
        client.close().await;
        result
    }

    pub async fn search(&self, query: &str, page: usize) -> Result<Vec<Post>> {
        let mut client = self.open_client().await?;
        let result = client.search(query, page).await;
        client.close().await;
        result
    }

    pub async fn recent(&self, page: usize) -> Result<Vec<Post>> {
        let mut client = self.open_client().await?;
        let result = client.recent(page).await;
        client.close().await;
        result
    }

    pub async fn popular(&self, page: usize) -> Result<Vec<Post>> {
        let mut client = self.open_client().await?;
        let result = client.popular(page).await;
        client.close().await;
        result
    }

    pub async fn collection(&self, target: &Address, public_key: &[u8]) -> Result<MessageCollection> {
        let mut client = self.open_client().await?;
        let result = client.collection(target, public_key).await;
        client.close().await;
        result
    }

    pub async fn request_add_peer(&self, target: &Address) -> Result<()> {
        let mut client = self.open_client().await?;
        let result = client.request_add_peer(target).await;
        client.close().await;
        result
    }

    /// Re-fetch the peer's own entry and cache it.
    pub async fn refresh_entry(&self) -> Result<Entry> {
        let fresh = self.query(&self.address()).await?;
        if fresh.address != self.address() {
            return Err(ZifError::verify("peer returned someone else's entry"));
        }
        *self.entry.write().await = fresh.clone();
        info!(peer = %self.address(), "refreshed entry");
        Ok(fresh)
    }

    /// Seed a routing table from this peer: store its own entry, then ask
    /// for the closest entries to ourselves and store every one that
    /// verifies. After a bootstrap it should be possible to resolve any
    /// address on the network through these.
    pub async fn bootstrap(&self, dht: &Dht) -> Result<()> {
        self.ping(PING_TIMEOUT).await?;

        let own = self.refresh_entry().await?;
        dht.insert(own)?;

        let mut client = self.open_client().await?;
        let found = client.find_closest(&dht.address()).await;
        client.close().await;
        let found = found?;

        let mut stored = 0usize;
        for entry in found {
            if entry.address == dht.address() {
                continue;
            }
            if let Err(e) = dht.insert(entry) {
                debug!(error = %e, "bootstrap entry rejected");
                continue;
            }
            stored += 1;
        }

        info!(peers = stored, "bootstrapped");
        Ok(())
    }

    /// Download this peer's whole catalog into `store`, verifying every
    /// piece against the signed hash list. Progress is reported as piece
    /// indices. A hash mismatch aborts without committing the bad piece;
    /// earlier pieces stay.
    pub async fn mirror(
        &self,
        store: &dyn CatalogStore,
        collection_path: &Path,
        piece_size: usize,
        progress: &mpsc::Sender<usize>,
    ) -> Result<()> {
        self.ping(PING_TIMEOUT).await?;
        let entry = self.refresh_entry().await?;
        info!(peer = %entry.address, "mirroring");

        let mut client = self.open_client().await?;
        let mcol = client.collection(&entry.address, &entry.public_key).await;
        client.close().await;
        let mcol = mcol?;

        Collection {
            hash_list: mcol.hash_list.clone(),
        }
        .save(collection_path)?;

        if store.post_count() == entry.post_count.max(0) as usize {
            info!("already up to date");
            return Ok(());
        }

        // Resume at the piece containing our current post count; the last
        // local piece may be partial, so it is re-fetched.
        let have_pieces = store.post_count().div_ceil(piece_size);
        let mut next = have_pieces.saturating_sub(1);

        info!(pieces = mcol.size, from = next, "downloading collection");

        while next < mcol.size {
            let want = MIRROR_BATCH.min(mcol.size - next);

            let mut client = self.open_client().await?;
            let pieces = client.pieces(&entry.address, next, want, piece_size).await;
            client.close().await;
            let pieces = pieces?;

            if pieces.is_empty() {
                return Err(ZifError::protocol("peer sent no pieces"));
            }

            for piece in &pieces {
                let expected = mcol
                    .hash_list
                    .get(piece.id * 32..piece.id * 32 + 32)
                    .ok_or(ZifError::IntegrityMismatch { piece: piece.id })?;
                if piece.hash().as_slice() != expected {
                    return Err(ZifError::IntegrityMismatch { piece: piece.id });
                }

                // Hash verified; commit, skipping posts we already hold
                let base = piece.id * piece_size;
                for (offset, post) in piece.posts.iter().enumerate() {
                    if base + offset < store.post_count() {
                        continue;
                    }
                    store.insert_post(post.clone())?;
                }

                let _ = progress.send(piece.id).await;
            }

            next += pieces.len();
            if pieces.len() < want {
                break;
            }
        }

        info!(peer = %entry.address, posts = store.post_count(), "mirror complete");
        Ok(())
    }

    /// Tear down the session and transport.
    pub async fn close(&self) {
        self.streams.close().await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
