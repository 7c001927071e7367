//! # Zif: a peer-to-peer catalog overlay
//!
//! Zif nodes publish signed self-descriptions ("entries") and signed hash
//! lists over their post catalogs, find each other through a Kademlia-style
//! DHT keyed by 20-byte addresses derived from Ed25519 keys, and mirror
//! each other's catalogs piece by piece, tracking who seeds what.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `address` | 20-byte node addresses, XOR metric, Base58-Check encoding |
//! | `identity` | Ed25519 keypairs and on-disk identity |
//! | `entry` | Signed entry records and their canonical byte form |
//! | `netdb` | Durable entry store (SQLite) + in-memory bucket table |
//! | `dht` | Facade over the network database |
//! | `message` | Framed, size-capped, gzip'd message envelopes |
//! | `mux` | Yamux-framed stream multiplexing over one connection |
//! | `stream` | Dialer plug-in and per-peer stream management |
//! | `handshake` | Mutual challenge-response authentication |
//! | `server` | Listener, stream rate limiting, message router |
//! | `client` | Typed RPCs with response validation |
//! | `peer` / `peer_manager` | Connected peers, heartbeat, announce |
//! | `data` | Posts, pieces, collections, catalog store seam |
//! | `seed` | Seed tracking with reciprocity checks |
//! | `explore` | Periodic DHT traversal |
//! | `node` | The local peer: composition root |
//! | `command` | Typed command surface for external frontends |
//!
//! Connections handshake mutually (signed challenge both ways), then carry
//! multiplexed streams; each stream is one request/response exchange.
//! Background loops (heartbeat, announce, explore, seed polling) trap
//! their errors, log and continue.

pub mod address;
pub mod client;
pub mod command;
pub mod config;
pub mod data;
pub mod dht;
pub mod entry;
pub mod error;
pub mod explore;
pub mod handshake;
pub mod identity;
pub mod message;
pub mod mux;
pub mod netdb;
pub mod node;
pub mod peer;
pub mod peer_manager;
pub mod seed;
pub mod server;
pub mod stream;

pub use address::Address;
pub use command::{Command, CommandResult};
pub use config::Config;
pub use data::{CatalogStore, Collection, MemoryCatalog, Piece, Post};
pub use dht::Dht;
pub use entry::Entry;
pub use error::{Result, ZifError};
pub use identity::Keypair;
pub use node::LocalPeer;
pub use peer::Peer;
pub use stream::{Dialer, TcpDialer};
