//! Typed RPCs over a single logical stream.
//!
//! A [`Client`] wraps one multiplexed stream for one request/response
//! exchange and is dropped afterwards. Every response that carries entries
//! is verified before it is handed back, and array sizes are capped: a peer
//! cannot hand us more than K closest entries or more than a page of posts.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::data::{parse_piece_stream, Piece, Post, MAX_PAGE_SIZE, MAX_PIECE_STREAM};
use crate::entry::{Entry, KeyValue};
use crate::error::{Result, ZifError};
use crate::message::{
    header, read_message, write_message, Message, MessageCollection, MessageRequestPiece,
    MessageSearchQuery,
};
use crate::mux::MuxStream;
use crate::netdb::BUCKET_SIZE;

/// Per-message deadline within an RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for one piece-stream response; pieces are bulk data.
const PIECES_TIMEOUT: Duration = Duration::from_secs(120);

pub struct Client {
    stream: MuxStream,
}

impl Client {
    pub fn new(stream: MuxStream) -> Self {
        Self { stream }
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        timeout(RPC_TIMEOUT, write_message(&mut self.stream, message))
            .await
            .map_err(|_| ZifError::PeerUnreachable)?
    }

    async fn recv(&mut self) -> Result<Message> {
        timeout(RPC_TIMEOUT, read_message(&mut self.stream))
            .await
            .map_err(|_| ZifError::PeerUnreachable)?
    }

    async fn expect_ok(&mut self) -> Result<()> {
        let reply = self.recv().await?;
        if !reply.ok() {
            return Err(ZifError::protocol("peer did not respond with ok"));
        }
        Ok(())
    }

    /// Push a signed entry to the peer for storage and onward gossip.
    pub async fn announce(&mut self, entry: &Entry) -> Result<()> {
        self.send(&Message::with_payload(header::DHT_ANNOUNCE, entry)?)
            .await?;
        self.expect_ok().await
    }

    /// Ask the peer for the entry stored under `target`.
    pub async fn query(&mut self, target: &Address) -> Result<Entry> {
        self.send(&Message::with_payload(header::DHT_QUERY, target)?)
            .await?;
        self.expect_ok().await?;

        let reply = self.recv().await?;
        if reply.header == header::NO {
            return Err(ZifError::AddressUnresolved(target.encode()));
        }
        if reply.header != header::DHT_QUERY {
            return Err(ZifError::protocol(format!(
                "expected query result, got {:?}",
                reply.header
            )));
        }

        let kv: KeyValue = reply.read_payload()?;
        let entry = kv.decode_entry()?;
        entry.verify()?;
        Ok(entry)
    }

    /// Ask the peer for its K closest known entries to `target`. Entries
    /// that fail verification are dropped; an oversized response is an
    /// error.
    pub async fn find_closest(&mut self, target: &Address) -> Result<Vec<Entry>> {
        self.send(&Message::with_payload(header::DHT_FIND_CLOSEST, target)?)
            .await?;
        self.expect_ok().await?;

        let reply = self.recv().await?;
        if reply.header != header::DHT_ENTRY {
            return Err(ZifError::protocol(format!(
                "expected entries, got {:?}",
                reply.header
            )));
        }

        let pairs: Vec<KeyValue> = reply.read_payload()?;
        if pairs.len() > BUCKET_SIZE {
            return Err(ZifError::protocol(format!(
                "too many entries returned: {}",
                pairs.len()
            )));
        }

        let mut entries = Vec::with_capacity(pairs.len());
        for kv in pairs {
            let entry = match kv.decode_entry() {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable entry");
                    continue;
                }
            };
            if let Err(e) = entry.verify() {
                warn!(address = %entry.address, error = %e, "dropping invalid entry");
                continue;
            }
            entries.push(entry);
        }

        info!(entries = entries.len(), "find closest complete");
        Ok(entries)
    }

    pub async fn search(&mut self, query: &str, page: usize) -> Result<Vec<Post>> {
        debug!(query, "searching peer");
        let payload = MessageSearchQuery {
            query: query.to_string(),
            page,
        };
        self.send(&Message::with_payload(header::SEARCH, &payload)?)
            .await?;
        self.read_posts().await
    }

    pub async fn recent(&mut self, page: usize) -> Result<Vec<Post>> {
        self.send(&Message::with_payload(header::RECENT, &(page as i64))?)
            .await?;
        self.read_posts().await
    }

    pub async fn popular(&mut self, page: usize) -> Result<Vec<Post>> {
        self.send(&Message::with_payload(header::POPULAR, &(page as i64))?)
            .await?;
        self.read_posts().await
    }

    async fn read_posts(&mut self) -> Result<Vec<Post>> {
        let reply = self.recv().await?;
        if reply.header != header::POSTS {
            return Err(ZifError::protocol(format!(
                "expected posts, got {:?}",
                reply.header
            )));
        }

        let posts: Vec<Post> = reply.read_payload()?;
        if posts.len() > MAX_PAGE_SIZE {
            return Err(ZifError::protocol(format!(
                "oversized post page: {}",
                posts.len()
            )));
        }
        Ok(posts)
    }

    /// Fetch the signed hash list for `address` and verify it against the
    /// owner's public key before returning it.
    pub async fn collection(
        &mut self,
        address: &Address,
        public_key: &[u8],
    ) -> Result<MessageCollection> {
        info!(target = %address, "requesting hash list");
        self.send(&Message::with_payload(header::REQUEST_HASH_LIST, address)?)
            .await?;

        let reply = self.recv().await?;
        if reply.header == header::NO {
            return Err(ZifError::protocol("peer has no hash list for address"));
        }
        if reply.header != header::HASH_LIST {
            return Err(ZifError::protocol(format!(
                "expected hash list, got {:?}",
                reply.header
            )));
        }

        let collection: MessageCollection = reply.read_payload()?;
        collection.verify(public_key)?;

        info!(pieces = collection.size, "received valid hash list");
        Ok(collection)
    }

    /// Fetch `length` pieces starting at piece `id`. The response is a raw
    /// gzip record stream terminated by the peer half-closing, parsed and
    /// split back into pieces here. Hash checking is the caller's job;
    /// it owns the signed hash list.
    pub async fn pieces(
        &mut self,
        address: &Address,
        id: usize,
        length: usize,
        piece_size: usize,
    ) -> Result<Vec<Piece>> {
        let request = MessageRequestPiece {
            address: address.encode(),
            id,
            length,
        };
        self.send(&Message::with_payload(header::REQUEST_PIECE, &request)?)
            .await?;

        let mut raw = Vec::new();
        timeout(
            PIECES_TIMEOUT,
            (&mut self.stream).take(MAX_PIECE_STREAM).read_to_end(&mut raw),
        )
        .await
        .map_err(|_| ZifError::PeerUnreachable)??;

        if raw.len() as u64 >= MAX_PIECE_STREAM {
            return Err(ZifError::protocol("piece stream exceeds ceiling"));
        }

        parse_piece_stream(&raw, id, length, piece_size)
    }

    /// Ask the peer to record us as a seed for `target`.
    pub async fn request_add_peer(&mut self, target: &Address) -> Result<()> {
        info!(target = %target, "registering as seed");
        self.send(&Message::with_payload(header::REQUEST_ADD_PEER, target)?)
            .await?;
        self.expect_ok().await?;
        info!("registered as seed peer");
        Ok(())
    }

    /// Protocol-level liveness check over this stream.
    pub async fn ping(&mut self) -> Result<()> {
        self.send(&Message::new(header::PING)).await?;
        let reply = self.recv().await?;
        if reply.header != header::PONG {
            return Err(ZifError::protocol("expected pong"));
        }
        Ok(())
    }

    /// Half-close the underlying stream.
    pub async fn close(mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.stream.shutdown().await;
    }
}
