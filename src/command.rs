//! Command surface for external frontends.
//!
//! The HTTP daemon and CLI live outside the core; what they speak is this
//! exhaustive [`Command`] enum. Adding a verb without handling it is a
//! compile error, and every result is a typed [`CommandResult`] rather
//! than loose JSON.

use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::data::Post;
use crate::entry::Entry;
use crate::error::{Result, ZifError};
use crate::node::{LocalPeer, MirrorProgress};
use crate::peer::PING_TIMEOUT;

#[derive(Clone, Debug)]
pub enum Command {
    /// Transport-level ping of a connected (or connectable) peer.
    Ping(String),
    /// Push our signed entry to the given peer.
    Announce(String),
    /// Resolve a Zif address to its entry.
    Resolve(String),
    /// Bootstrap the routing table from a `host:port`.
    Bootstrap(String),
    /// Mirror a peer's catalog and register as a seed.
    Mirror(String),
    GetMirrorProgress(String),
    /// Addresses of currently connected peers.
    Peers,
    /// Ask `remote` to record us as a seed for `target`.
    RequestAddPeer { remote: String, target: String },

    PeerRecent { address: String, page: usize },
    PeerPopular { address: String, page: usize },
    PeerSearch { address: String, query: String, page: usize },

    SelfRecent { page: usize },
    SelfPopular { page: usize },
    SelfSearch { query: String, page: usize },
    SelfSuggest { query: String },
    /// Rebuild the catalog's search index.
    SelfIndex,

    /// Full-text search over known entries.
    EntrySearch { query: String },

    AddPost(Post),
    AddMeta { id: i64, meta: String },
    SaveCollection,
    RebuildCollection,

    LocalGet(String),
    LocalSet { key: String, value: String },

    /// Start the periodic DHT exploration job.
    Explore,
    /// Base58-Check encode raw address bytes.
    AddressEncode(Vec<u8>),
}

#[derive(Clone, Debug)]
pub enum CommandResult {
    Ok,
    Rtt(Duration),
    Entry(Box<Entry>),
    Entries(Vec<Entry>),
    Posts(Vec<Post>),
    Suggestions(Vec<String>),
    PeerList(Vec<Address>),
    Progress(MirrorProgress),
    Value(String),
    PostId(i64),
    Address(String),
}

impl LocalPeer {
    /// Execute one command against this node.
    pub async fn dispatch(self: &Arc<Self>, command: Command) -> Result<CommandResult> {
        match command {
            Command::Ping(addr) => {
                let peer = self.connect(Address::decode(&addr)?).await?;
                let rtt = peer.ping(PING_TIMEOUT).await?;
                Ok(CommandResult::Rtt(rtt))
            }
            Command::Announce(addr) => {
                let peer = self.connect(Address::decode(&addr)?).await?;
                self.sign_entry();
                peer.announce(&self.entry()).await?;
                Ok(CommandResult::Ok)
            }
            Command::Resolve(addr) => {
                let entry = self.resolve(Address::decode(&addr)?).await?;
                Ok(CommandResult::Entry(Box::new(entry)))
            }
            Command::Bootstrap(host) => {
                self.bootstrap(&host).await?;
                Ok(CommandResult::Ok)
            }
            Command::Mirror(addr) => {
                self.mirror(Address::decode(&addr)?).await?;
                Ok(CommandResult::Ok)
            }
            Command::GetMirrorProgress(addr) => {
                let target = Address::decode(&addr)?;
                let progress = self
                    .mirror_progress(&target)
                    .ok_or_else(|| ZifError::protocol("no mirror in progress"))?;
                Ok(CommandResult::Progress(progress))
            }
            Command::Peers => {
                let addresses = self.peers().peers().iter().map(|p| p.address()).collect();
                Ok(CommandResult::PeerList(addresses))
            }
            Command::RequestAddPeer { remote, target } => {
                let peer = self.connect(Address::decode(&remote)?).await?;
                peer.request_add_peer(&Address::decode(&target)?).await?;
                Ok(CommandResult::Ok)
            }

            Command::PeerRecent { address, page } => {
                let peer = self.connect(Address::decode(&address)?).await?;
                Ok(CommandResult::Posts(peer.recent(page).await?))
            }
            Command::PeerPopular { address, page } => {
                let peer = self.connect(Address::decode(&address)?).await?;
                Ok(CommandResult::Posts(peer.popular(page).await?))
            }
            Command::PeerSearch {
                address,
                query,
                page,
            } => {
                let peer = self.connect(Address::decode(&address)?).await?;
                Ok(CommandResult::Posts(peer.search(&query, page).await?))
            }

            Command::SelfRecent { page } => {
                Ok(CommandResult::Posts(self.catalog().query_recent(page)?))
            }
            Command::SelfPopular { page } => {
                Ok(CommandResult::Posts(self.catalog().query_popular(page)?))
            }
            Command::SelfSearch { query, page } => {
                Ok(CommandResult::Posts(self.catalog().search(&query, page)?))
            }
            Command::SelfSuggest { query } => {
                Ok(CommandResult::Suggestions(self.catalog().suggest(&query)?))
            }
            Command::SelfIndex => {
                self.catalog().rebuild_index()?;
                Ok(CommandResult::Ok)
            }

            Command::EntrySearch { query } => {
                Ok(CommandResult::Entries(self.dht().search(&query)?))
            }

            Command::AddPost(post) => Ok(CommandResult::PostId(self.add_post(post)?)),
            Command::AddMeta { id, meta } => {
                self.catalog().add_meta(id, &meta)?;
                Ok(CommandResult::Ok)
            }
            Command::SaveCollection => {
                self.save_collection()?;
                Ok(CommandResult::Ok)
            }
            Command::RebuildCollection => {
                self.rebuild_collection()?;
                Ok(CommandResult::Ok)
            }

            Command::LocalGet(key) => Ok(CommandResult::Value(self.local_get(&key)?)),
            Command::LocalSet { key, value } => {
                self.local_set(&key, &value)?;
                Ok(CommandResult::Ok)
            }

            Command::Explore => {
                self.start_exploring();
                Ok(CommandResult::Ok)
            }
            Command::AddressEncode(raw) => {
                let address = Address::from_bytes(&raw)?;
                Ok(CommandResult::Address(address.encode()))
            }
        }
    }
}
