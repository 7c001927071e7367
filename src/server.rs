//! Protocol server and router.
//!
//! The listener accepts TCP connections, checks the magic and version
//! words, runs the responder side of the handshake and registers the peer.
//! Each registered session then gets a stream listener: inbound streams are
//! rate limited (4 per second, bursting to 3) and every message read off a
//! stream is dispatched by header tag to its handler. Unknown headers are
//! logged and dropped; handler errors close the stream but leave the
//! session alive.

use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::address::Address;
use crate::data::terminator;
use crate::entry::{unix_now, Entry, KeyValue};
use crate::error::{Result, ZifError};
use crate::handshake;
use crate::message::{
    header, read_message, write_message, Message, MessageRequestPiece, MessageSearchQuery,
    PROTO_VERSION, PROTO_ZIF,
};
use crate::mux::MuxStream;
use crate::netdb::BUCKET_SIZE;
use crate::node::LocalPeer;
use crate::peer::Peer;
use crate::stream::{StreamManager, TokenBucket, HANDSHAKE_TIMEOUT};

/// Deadline for the magic words of a fresh connection.
const MAGIC_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest accepted search query.
const MAX_SEARCH_LENGTH: usize = 256;

/// Accept connections forever. Each connection gets its own task for the
/// magic exchange, handshake and session.
pub async fn serve(lp: Arc<LocalPeer>, listener: TcpListener) {
    info!(addr = ?listener.local_addr().ok(), "listening");

    loop {
        let (socket, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };

        debug!(%remote, "new tcp connection");
        let lp = lp.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(lp, socket).await {
                warn!(%remote, error = %e, "connection failed");
            }
        });
    }
}

async fn handle_connection(lp: Arc<LocalPeer>, mut socket: TcpStream) -> Result<()> {
    let (magic, version) = timeout(MAGIC_TIMEOUT, async {
        let magic = socket.read_u16_le().await?;
        let version = socket.read_u16_le().await?;
        Ok::<_, std::io::Error>((magic, version))
    })
    .await
    .map_err(|_| ZifError::protocol("timed out waiting for magic"))??;

    if magic != PROTO_ZIF {
        return Err(ZifError::protocol(format!("not a zif connection: {magic:#x}")));
    }
    if version != PROTO_VERSION {
        return Err(ZifError::protocol(format!("protocol version mismatch: {version:#x}")));
    }

    let outcome = timeout(
        HANDSHAKE_TIMEOUT,
        handshake::respond(&mut socket, &lp.entry(), lp.keypair()),
    )
    .await
    .map_err(|_| ZifError::protocol("handshake timed out"))??;

    if outcome.entry.address == lp.address() {
        return Err(ZifError::protocol("refusing connection from ourselves"));
    }

    let remote_entry = outcome.entry.clone();
    let manager = StreamManager::accept(socket, outcome);
    let peer = Peer::new(manager);

    // The handshake verified this entry; remember it
    if let Err(e) = lp.dht().insert(remote_entry) {
        debug!(error = %e, "could not store handshake entry");
    }

    let registered = lp.peers().register(&lp, peer.clone(), None)?;
    if !Arc::ptr_eq(&registered, &peer) {
        // Already connected to this peer; drop the duplicate session
        peer.close().await;
        return Ok(());
    }

    listen_streams(lp, peer).await;
    Ok(())
}

/// Accept multiplexed streams from a registered peer until the session
/// dies, then remove the peer.
pub async fn listen_streams(lp: Arc<LocalPeer>, peer: Arc<Peer>) {
    // Allowed to accept 4 streams per second, bursting to three.
    let mut limiter = TokenBucket::new(4.0, 3);

    loop {
        let stream = match peer.session().accept_stream().await {
            Ok(stream) => stream,
            Err(_) => {
                info!(peer = %peer.address(), "peer closed connection");
                lp.handle_close(&peer.address()).await;
                return;
            }
        };
        limiter.acquire().await;

        debug!(peer = %peer.address(), stream = stream.id(), "accepted stream");
        let lp = lp.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            handle_stream(lp, peer, stream).await;
        });
    }
}

async fn handle_stream(lp: Arc<LocalPeer>, peer: Arc<Peer>, mut stream: MuxStream) {
    loop {
        let message = match read_message(&mut stream).await {
            Ok(message) => message,
            // Stream closed by the peer; normal end of an RPC
            Err(_) => return,
        };

        if let Err(e) = route(&lp, &peer, &message, &mut stream).await {
            warn!(peer = %peer.address(), header = %message.header, error = %e, "handler failed");
            return;
        }
    }
}

/// Dispatch one message by header tag.
async fn route(
    lp: &Arc<LocalPeer>,
    peer: &Arc<Peer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    match message.header.as_str() {
        header::DHT_QUERY => handle_query(lp, peer, message, stream).await,
        header::DHT_FIND_CLOSEST => handle_find_closest(lp, peer, message, stream).await,
        header::DHT_ANNOUNCE => handle_announce(lp, peer, message, stream).await,
        header::SEARCH => handle_search(lp, message, stream).await,
        header::RECENT => handle_recent(lp, message, stream).await,
        header::POPULAR => handle_popular(lp, message, stream).await,
        header::REQUEST_HASH_LIST => handle_hash_list(lp, message, stream).await,
        header::REQUEST_PIECE => handle_piece(lp, peer, message, stream).await,
        header::REQUEST_ADD_PEER => handle_add_peer(lp, peer, message, stream).await,
        header::PING => handle_ping(peer, stream).await,
        other => {
            warn!(header = other, "unknown message type");
            Ok(())
        }
    }
}

async fn handle_query(
    lp: &Arc<LocalPeer>,
    peer: &Arc<Peer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    peer.limiter.queries.lock().await.acquire().await;

    let target: Address = message.read_payload()?;
    info!(target = %target, "received query");
    write_message(stream, &Message::new(header::OK)).await?;

    let found = if target == lp.address() {
        Some(lp.entry())
    } else {
        lp.dht().query(&target)?
    };

    match found {
        Some(entry) => {
            let kv = KeyValue::from_entry(&entry)?;
            write_message(stream, &Message::with_payload(header::DHT_QUERY, &kv)?).await
        }
        None => write_message(stream, &Message::new(header::NO)).await,
    }
}

async fn handle_find_closest(
    lp: &Arc<LocalPeer>,
    peer: &Arc<Peer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    peer.limiter.queries.lock().await.acquire().await;

    let target: Address = message.read_payload()?;
    info!(target = %target, "received find closest");
    write_message(stream, &Message::new(header::OK)).await?;

    let entries = if target == lp.address() {
        vec![lp.entry()]
    } else {
        lp.dht().find_closest(&target)?
    };

    let mut pairs = Vec::with_capacity(entries.len().min(BUCKET_SIZE));
    for entry in entries.into_iter().take(BUCKET_SIZE) {
        pairs.push(KeyValue::from_entry(&entry)?);
    }

    write_message(stream, &Message::with_payload(header::DHT_ENTRY, &pairs)?).await
}

async fn handle_announce(
    lp: &Arc<LocalPeer>,
    peer: &Arc<Peer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    peer.limiter.announces.lock().await.acquire().await;

    let mut entry: Entry = message.read_payload()?;
    entry.seen = unix_now();
    let addr = entry.address;
    info!(%addr, "announce");

    match lp.dht().insert(entry) {
        Ok(()) => {
            write_message(stream, &Message::new(header::OK)).await?;
            info!(peer = %addr, "saved entry");
            Ok(())
        }
        Err(e) => {
            write_message(stream, &Message::no("entry rejected")).await?;
            Err(e)
        }
    }
}

async fn handle_search(
    lp: &Arc<LocalPeer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    let query: MessageSearchQuery = message.read_payload()?;
    if query.query.len() > MAX_SEARCH_LENGTH {
        return Err(ZifError::protocol("search query too long"));
    }

    info!(query = %query.query, "search received");
    let posts = lp.catalog().search(&query.query, query.page)?;
    write_message(stream, &Message::with_payload(header::POSTS, &posts)?).await
}

async fn handle_recent(
    lp: &Arc<LocalPeer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    let page = message.read_int()? as usize;
    let posts = lp.catalog().query_recent(page)?;
    info!(posts = posts.len(), "sending recent posts");
    write_message(stream, &Message::with_payload(header::POSTS, &posts)?).await
}

async fn handle_popular(
    lp: &Arc<LocalPeer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    let page = message.read_int()? as usize;
    let posts = lp.catalog().query_popular(page)?;
    info!(posts = posts.len(), "sending popular posts");
    write_message(stream, &Message::with_payload(header::POSTS, &posts)?).await
}

async fn handle_hash_list(
    lp: &Arc<LocalPeer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    let target: Address = message.read_payload()?;
    info!(target = %target, "hash list request");

    let collection = match lp.collection_message(&target) {
        Some(collection) => collection,
        None => {
            return write_message(stream, &Message::no("no hash list for address")).await;
        }
    };

    write_message(stream, &Message::with_payload(header::HASH_LIST, &collection)?).await
}

async fn handle_piece(
    lp: &Arc<LocalPeer>,
    peer: &Arc<Peer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    peer.limiter.queries.lock().await.acquire().await;

    let request: MessageRequestPiece = message.read_payload()?;
    info!(id = request.id, length = request.length, "piece request");

    let target = Address::decode(&request.address)?;
    let store = lp
        .store_for(&target)
        .ok_or_else(|| ZifError::protocol("piece not found"))?;

    // One gzip stream for the whole range, closed with a single terminator.
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for id in request.id..request.id + request.length {
        let piece = store.query_piece(id, crate::data::PIECE_SIZE)?;
        if piece.posts.is_empty() {
            break;
        }
        for post in &piece.posts {
            post.write_record(&mut encoder)?;
        }
    }
    terminator().write_record(&mut encoder)?;
    let payload = encoder.finish()?;

    stream.write_all(&payload).await?;
    stream.shutdown().await?;

    info!(bytes = payload.len(), "sent pieces");
    Ok(())
}

async fn handle_add_peer(
    lp: &Arc<LocalPeer>,
    peer: &Arc<Peer>,
    message: &Message,
    stream: &mut MuxStream,
) -> Result<()> {
    let target: Address = message.read_payload()?;
    let requester = peer.address();
    info!(target = %target, seed = %requester, "add peer request");

    if target == lp.address() {
        lp.add_seed(requester)?;
        info!(seed = %requester, "new seed peer");
    } else {
        match lp.dht().query(&target)? {
            Some(mut entry) => {
                if !entry.seeds.contains(&requester) {
                    entry.seeds.push(requester);
                    lp.dht().insert(entry)?;
                }
            }
            None => {
                write_message(stream, &Message::no("unknown entry")).await?;
                return Err(ZifError::AddressUnresolved(target.encode()));
            }
        }
    }

    write_message(stream, &Message::new(header::OK)).await
}

async fn handle_ping(peer: &Arc<Peer>, stream: &mut MuxStream) -> Result<()> {
    debug!(peer = %peer.address(), "ping");
    write_message(stream, &Message::new(header::PONG)).await
}
