//! Connection handshake.
//!
//! Both ends of a fresh connection prove two things before any stream is
//! multiplexed: that their signed entry is well formed, and that they hold
//! the private key behind it. The latter is a challenge-response: each
//! side signs a 20-byte random cookie picked by the other, so a replayed
//! or stolen entry is useless without the key.
//!
//! The initiator proves itself first, then the roles reverse on the same
//! connection. Failure at any step closes the connection; no partial state
//! survives.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::entry::Entry;
use crate::error::{Result, ZifError};
use crate::identity::{verify_signature, Keypair};
use crate::message::{header, read_message, write_message, Capabilities, Message};

/// Size of the signed challenge.
const COOKIE_SIZE: usize = 20;

/// What a completed handshake tells us about the peer.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub entry: Entry,
    pub capabilities: Capabilities,
}

/// Run the initiator's side: prove ourselves, then verify the responder.
pub async fn initiate<S>(stream: &mut S, local: &Entry, keypair: &Keypair) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    send_side(stream, local, keypair).await?;
    let outcome = recv_side(stream).await?;
    info!(peer = %outcome.entry.address, "handshake complete");
    Ok(outcome)
}

/// Run the responder's side: verify the initiator, then prove ourselves.
pub async fn respond<S>(stream: &mut S, local: &Entry, keypair: &Keypair) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let outcome = recv_side(stream).await?;
    send_side(stream, local, keypair).await?;
    info!(peer = %outcome.entry.address, "incoming handshake complete");
    Ok(outcome)
}

/// Present our entry and answer the peer's cookie challenge.
async fn send_side<S>(stream: &mut S, local: &Entry, keypair: &Keypair) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!("sending handshake header");
    let header_msg = Message::with_payload(header::HEADER, local)?;
    write_message(stream, &header_msg).await?;

    let reply = read_message(stream).await?;
    if !reply.ok() {
        return Err(ZifError::protocol("peer refused header"));
    }

    let caps = Message::with_payload(header::CAP, &Capabilities::ours())?;
    write_message(stream, &caps).await?;

    let cookie_msg = read_message(stream).await?;
    if cookie_msg.header != header::COOKIE {
        return Err(ZifError::protocol(format!(
            "expected cookie, got {:?}",
            cookie_msg.header
        )));
    }
    let cookie: Vec<u8> = cookie_msg.read_payload()?;
    if cookie.len() != COOKIE_SIZE {
        return Err(ZifError::protocol("cookie has wrong size"));
    }

    let signature = keypair.sign(&cookie).to_vec();
    let sig_msg = Message::with_payload(header::SIG, &signature)?;
    write_message(stream, &sig_msg).await?;

    let reply = read_message(stream).await?;
    if !reply.ok() {
        return Err(ZifError::protocol("peer refused signature"));
    }

    Ok(())
}

/// Receive the peer's entry, verify it, and challenge for the key.
async fn recv_side<S>(stream: &mut S) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let header_msg = read_message(stream).await?;
    if header_msg.header != header::HEADER {
        let _ = write_message(stream, &Message::no("expected header")).await;
        return Err(ZifError::protocol(format!(
            "expected header, got {:?}",
            header_msg.header
        )));
    }

    let entry: Entry = match header_msg.read_payload() {
        Ok(entry) => entry,
        Err(e) => {
            let _ = write_message(stream, &Message::no("undecodable entry")).await;
            return Err(e);
        }
    };

    if let Err(e) = entry.verify() {
        let _ = write_message(stream, &Message::no(&e.to_string())).await;
        return Err(e);
    }

    info!(peer = %entry.address, "incoming connection");
    write_message(stream, &Message::new(header::OK)).await?;

    let caps_msg = read_message(stream).await?;
    if caps_msg.header != header::CAP {
        return Err(ZifError::protocol(format!(
            "expected capabilities, got {:?}",
            caps_msg.header
        )));
    }
    let capabilities: Capabilities = caps_msg.read_payload()?;

    // The cookie proves key possession: it is fresh, so an attacker cannot
    // have a cached signature for it.
    let mut cookie = vec![0u8; COOKIE_SIZE];
    rand::thread_rng().fill_bytes(&mut cookie);

    let cookie_msg = Message::with_payload(header::COOKIE, &cookie)?;
    write_message(stream, &cookie_msg).await?;

    let sig_msg = read_message(stream).await?;
    if sig_msg.header != header::SIG {
        return Err(ZifError::protocol(format!(
            "expected signature, got {:?}",
            sig_msg.header
        )));
    }
    let signature: Vec<u8> = sig_msg.read_payload()?;

    if !verify_signature(&entry.public_key, &cookie, &signature) {
        let _ = write_message(stream, &Message::no("signature not verified")).await;
        return Err(ZifError::verify("peer failed cookie challenge"));
    }

    write_message(stream, &Message::new(header::OK)).await?;
    debug!(peer = %entry.address, "peer verified");

    Ok(HandshakeOutcome {
        entry,
        capabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> (Keypair, Entry) {
        let keypair = Keypair::generate();
        let mut entry = Entry::new(&keypair, "hs-test", "", "127.0.0.1", 5050);
        entry.sign(&keypair);
        (keypair, entry)
    }

    #[tokio::test]
    async fn mutual_handshake_succeeds() {
        let (kp_a, entry_a) = node();
        let (kp_b, entry_b) = node();

        let (mut side_a, mut side_b) = tokio::io::duplex(1 << 16);

        let kp_b_address = kp_b.address();
        let responder = tokio::spawn(async move { respond(&mut side_b, &entry_b, &kp_b).await });

        let outcome_a = initiate(&mut side_a, &entry_a, &kp_a).await.unwrap();
        let outcome_b = responder.await.unwrap().unwrap();

        assert_eq!(outcome_a.entry.name, "hs-test");
        assert_eq!(outcome_b.entry.address, kp_a.address());
        assert_eq!(outcome_a.entry.address, kp_b_address);
        assert!(outcome_b.capabilities.compression.contains(&"gzip".to_string()));
    }

    #[tokio::test]
    async fn tampered_entry_fails_handshake() {
        let (kp_a, mut entry_a) = node();
        let (kp_b, entry_b) = node();

        // Flip a signed field after signing
        entry_a.post_count += 1;

        let (mut side_a, mut side_b) = tokio::io::duplex(1 << 16);

        let responder = tokio::spawn(async move { respond(&mut side_b, &entry_b, &kp_b).await });

        assert!(initiate(&mut side_a, &entry_a, &kp_a).await.is_err());
        assert!(responder.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn wrong_key_fails_cookie_challenge() {
        let (_, entry_a) = node();
        let (kp_b, entry_b) = node();
        // Initiator presents A's valid entry but holds a different key
        let imposter = Keypair::generate();

        let (mut side_a, mut side_b) = tokio::io::duplex(1 << 16);

        let responder = tokio::spawn(async move { respond(&mut side_b, &entry_b, &kp_b).await });

        assert!(initiate(&mut side_a, &entry_a, &imposter).await.is_err());
        let err = responder.await.unwrap();
        assert!(err.is_err());
    }
}
