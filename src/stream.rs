//! Connection establishment and stream management.
//!
//! One [`StreamManager`] per remote peer: it owns the multiplexed session
//! over the peer's TCP (or SOCKS-dialed) connection and hands out logical
//! streams for single RPCs. How the TCP connection is made is pluggable
//! through the [`Dialer`] trait; the Tor SOCKS5 dialer lives outside the
//! core and slots in here.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::entry::Entry;
use crate::error::{Result, ZifError};
use crate::handshake::{self, HandshakeOutcome};
use crate::identity::Keypair;
use crate::message::{choose_compression, Capabilities, PROTO_VERSION, PROTO_ZIF};
use crate::mux::{Mode, MuxStream, Session};

/// Deadline for opening one logical stream.
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the whole connect-and-handshake sequence.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How a TCP connection to a peer is made. The default dials directly;
/// a SOCKS5 implementation routes through Tor instead.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<TcpStream>;
}

/// Plain TCP dialer.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<TcpStream> {
        debug!(%addr, "dialing");
        TcpStream::connect(addr)
            .await
            .map_err(|_| ZifError::PeerUnreachable)
    }
}

/// Token bucket used for stream accept limiting and per-peer request
/// limiting. `acquire` waits until a token is available.
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: usize) -> Self {
        Self {
            tokens: burst as f64,
            capacity: burst as f64,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - self.tokens;
            let wait = deficit / self.rate_per_sec;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

/// The session and identity of one connected peer.
pub struct StreamManager {
    session: Session,
    remote: Entry,
    capabilities: Capabilities,
    compression: Option<String>,
}

impl StreamManager {
    /// Dial a peer, send the magic and version words, run the full
    /// handshake and attach the multiplexer in the client role.
    pub async fn open(
        addr: &str,
        dialer: &dyn Dialer,
        local: &Entry,
        keypair: &Keypair,
    ) -> Result<StreamManager> {
        let mut socket = dialer.dial(addr).await?;

        let outcome = timeout(HANDSHAKE_TIMEOUT, async {
            socket.write_u16_le(PROTO_ZIF).await?;
            socket.write_u16_le(PROTO_VERSION).await?;
            handshake::initiate(&mut socket, local, keypair).await
        })
        .await
        .map_err(|_| ZifError::PeerUnreachable)??;

        // The responder is the server for capability preference
        let compression = choose_compression(&Capabilities::ours(), &outcome.capabilities);
        let session = Session::attach(socket, Mode::Client);

        Ok(StreamManager {
            session,
            remote: outcome.entry,
            capabilities: outcome.capabilities,
            compression,
        })
    }

    /// Wrap an inbound connection whose magic words were already consumed
    /// and whose handshake completed; attaches in the server role.
    pub fn accept(socket: TcpStream, outcome: HandshakeOutcome) -> StreamManager {
        let compression = choose_compression(&outcome.capabilities, &Capabilities::ours());
        let session = Session::attach(socket, Mode::Server);

        StreamManager {
            session,
            remote: outcome.entry,
            capabilities: outcome.capabilities,
            compression,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn remote(&self) -> &Entry {
        &self.remote
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn compression(&self) -> Option<&str> {
        self.compression.as_deref()
    }

    /// Open a fresh logical stream for one RPC.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        timeout(STREAM_OPEN_TIMEOUT, self.session.open_stream())
            .await
            .map_err(|_| ZifError::PeerUnreachable)?
    }

    pub async fn ping(&self, deadline: Duration) -> Result<Duration> {
        self.session.ping(deadline).await
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_allows_burst_then_throttles() {
        let mut bucket = TokenBucket::new(1000.0, 3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        // At 1000/s a token is back within a few ms
        bucket.acquire().await;
    }

    #[tokio::test]
    async fn token_bucket_never_exceeds_burst() {
        let mut bucket = TokenBucket::new(1000.0, 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }
}
