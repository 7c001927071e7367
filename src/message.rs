//! Wire messages.
//!
//! Every logical message on a Zif stream is one envelope: a length-prefixed
//! bincode `{header, content}` pair, where `content` is a gzip-compressed
//! bincode payload. Both the frame and the decompressed payload are size
//! capped; oversized input fails the stream rather than the process.
//!
//! Header tags identify the operation; see the `header::*` constants.

use bincode::Options;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ZifError};

/// Ceiling for one framed envelope on the wire.
pub const MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

/// Ceiling for a payload after decompression.
pub const MAX_MESSAGE_CONTENT: usize = 4 * 1024 * 1024;

/// First bytes of every connection: `zf` magic then the protocol version,
/// both little-endian 16-bit words.
pub const PROTO_ZIF: u16 = 0x7a66;
pub const PROTO_VERSION: u16 = 0x0000;

/// Message header tags.
pub mod header {
    pub const HEADER: &str = "header";
    pub const CAP: &str = "cap";

    pub const OK: &str = "ok";
    pub const NO: &str = "no";
    pub const TERMINATE: &str = "term";
    pub const COOKIE: &str = "cookie";
    pub const SIG: &str = "sig";
    pub const DONE: &str = "done";

    pub const SEARCH: &str = "search";
    pub const RECENT: &str = "recent";
    pub const POPULAR: &str = "popular";

    pub const REQUEST_HASH_LIST: &str = "req.hashlist";
    pub const REQUEST_PIECE: &str = "req.piece";
    /// Ask the remote to record us as a seed for a given entry.
    pub const REQUEST_ADD_PEER: &str = "req.addpeer";

    pub const POSTS: &str = "posts";
    pub const HASH_LIST: &str = "hashlist";

    pub const DHT_ENTRY: &str = "dht.entry";
    pub const DHT_QUERY: &str = "dht.query";
    pub const DHT_ANNOUNCE: &str = "dht.announce";
    pub const DHT_FIND_CLOSEST: &str = "dht.findclosest";

    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// Bincode options with the given ceiling enforced.
fn bincode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .with_fixint_encoding()
}

/// Deserialize with the payload ceiling enforced. Use this instead of raw
/// `bincode::deserialize` anywhere the bytes came off the network.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode_options(MAX_MESSAGE_CONTENT).deserialize(bytes)?)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub header: String,
    pub content: Vec<u8>,
}

impl Message {
    pub fn new(header: &str) -> Self {
        Self {
            header: header.to_string(),
            content: Vec::new(),
        }
    }

    /// Build a message whose content is the gzip-compressed encoding of
    /// `payload`.
    pub fn with_payload<T: Serialize>(header: &str, payload: &T) -> Result<Self> {
        let encoded = bincode::serialize(payload)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&encoded)?;
        let content = encoder.finish()?;

        Ok(Self {
            header: header.to_string(),
            content,
        })
    }

    /// Decompress and decode the content. The decompressed size is capped
    /// before decoding; a payload that inflates past the ceiling fails.
    pub fn read_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let mut decoder = GzDecoder::new(self.content.as_slice()).take(MAX_MESSAGE_CONTENT as u64 + 1);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;

        if decompressed.len() > MAX_MESSAGE_CONTENT {
            return Err(ZifError::protocol("message content exceeds ceiling"));
        }

        deserialize_bounded(&decompressed)
    }

    pub fn read_int(&self) -> Result<i64> {
        self.read_payload()
    }

    /// Shorthand for "did the peer accept".
    pub fn ok(&self) -> bool {
        self.header == header::OK
    }

    /// An error reply: `no` with the reason as payload.
    pub fn no(reason: &str) -> Self {
        Message::with_payload(header::NO, &reason.to_string())
            .unwrap_or_else(|_| Message::new(header::NO))
    }
}

/// Write one envelope: `u32` little-endian length, then the bincode bytes.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let encoded = bincode::serialize(message)?;
    if encoded.len() > MAX_MESSAGE_SIZE {
        return Err(ZifError::protocol("outgoing message exceeds ceiling"));
    }

    writer.write_u32_le(encoded.len() as u32).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one envelope, enforcing the frame ceiling before allocating.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin + Send,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ZifError::protocol(format!("frame of {len} bytes exceeds ceiling")));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    // The envelope ceiling is wider than the payload ceiling; the content
    // field alone may be up to MAX_MESSAGE_SIZE compressed.
    Ok(bincode_options(MAX_MESSAGE_SIZE + 64).deserialize(&buf)?)
}

/// Capabilities exchanged during the handshake. Compression is chosen by
/// intersecting the lists, server preference first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub compression: Vec<String>,
}

impl Capabilities {
    pub fn ours() -> Self {
        Self {
            compression: vec!["gzip".to_string()],
        }
    }
}

pub fn choose_compression(client: &Capabilities, server: &Capabilities) -> Option<String> {
    server
        .compression
        .iter()
        .find(|c| client.compression.contains(c))
        .cloned()
}

/// Signed hash list response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageCollection {
    /// SHA3-256 root over `hash_list`.
    pub hash: Vec<u8>,
    #[serde(rename = "hashList")]
    pub hash_list: Vec<u8>,
    /// Number of pieces.
    pub size: usize,
    /// Owner's signature over `hash`.
    pub sig: Vec<u8>,
}

impl MessageCollection {
    /// Check internal consistency and the owner's signature over the root.
    pub fn verify(&self, public_key: &[u8]) -> Result<()> {
        if self.hash_list.len() % 32 != 0 {
            return Err(ZifError::verify("hash list length not a multiple of 32"));
        }

        if self.size != self.hash_list.len() / 32 {
            return Err(ZifError::verify("hash list size field mismatch"));
        }

        let root = crate::data::root_hash_of(&self.hash_list);
        if root.as_slice() != self.hash.as_slice() {
            return Err(ZifError::verify("hash list root mismatch"));
        }

        if !crate::identity::verify_signature(public_key, &self.hash, &self.sig) {
            return Err(ZifError::verify("hash list signature check failed"));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRequestPiece {
    pub address: String,
    pub id: usize,
    pub length: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSearchQuery {
    pub query: String,
    pub page: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn envelope_round_trip() {
        let message = Message::with_payload(header::DHT_QUERY, &"payload".to_string()).unwrap();

        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_message(&mut a, &message).await.unwrap();

        let received = read_message(&mut b).await.unwrap();
        assert_eq!(received.header, header::DHT_QUERY);
        let payload: String = received.read_payload().unwrap();
        assert_eq!(payload, "payload");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_u32_le((MAX_MESSAGE_SIZE as u32) + 1).await;
        });
        assert!(read_message(&mut b).await.is_err());
    }

    #[test]
    fn decompression_bomb_is_rejected() {
        // A content field that inflates past the ceiling must fail without
        // allocating the whole thing.
        let huge = vec![0u8; MAX_MESSAGE_CONTENT + 1024];
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&huge).unwrap();
        let message = Message {
            header: header::DHT_ENTRY.to_string(),
            content: encoder.finish().unwrap(),
        };

        assert!(message.read_payload::<Vec<u8>>().is_err());
    }

    #[test]
    fn read_int_round_trip() {
        let message = Message::with_payload(header::RECENT, &42i64).unwrap();
        assert_eq!(message.read_int().unwrap(), 42);
    }

    #[test]
    fn compression_choice_prefers_server_order() {
        let client = Capabilities {
            compression: vec!["lz4".into(), "gzip".into()],
        };
        let server = Capabilities {
            compression: vec!["gzip".into(), "lz4".into()],
        };
        assert_eq!(choose_compression(&client, &server).as_deref(), Some("gzip"));

        let none = Capabilities {
            compression: vec!["snappy".into()],
        };
        assert_eq!(choose_compression(&none, &server), None);
    }

    #[test]
    fn collection_message_verifies_root_and_signature() {
        use crate::data::root_hash_of;
        use crate::identity::Keypair;

        let keypair = Keypair::generate();
        let hash_list = vec![7u8; 96];
        let root = root_hash_of(&hash_list);

        let mut collection = MessageCollection {
            hash: root.to_vec(),
            hash_list,
            size: 3,
            sig: keypair.sign(&root).to_vec(),
        };
        collection.verify(&keypair.public_key_bytes()).unwrap();

        collection.hash_list[0] ^= 1;
        assert!(collection.verify(&keypair.public_key_bytes()).is_err());
    }
}
