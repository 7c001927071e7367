//! DHT exploration.
//!
//! A scheduled job that keeps the routing table fresh: every tick it takes
//! one candidate address off a queue, connects, and asks the peer for the
//! closest entries to a random address, to the candidate itself, and to
//! us. Newly discovered entries are stored and themselves enqueued, so the
//! walk spreads. When the queue runs dry it is reseeded from our own
//! table, shuffled; a candidate is otherwise left alone for an hour
//! between visits.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::entry::Entry;
use crate::error::Result;
use crate::node::LocalPeer;

/// Tick period of the explore job.
pub const EXPLORE_FREQUENCY: Duration = Duration::from_secs(2 * 60);

/// Candidate queue capacity.
pub const EXPLORE_BUFFER_SIZE: usize = 100;

/// A candidate is not re-explored within this window, unless the queue
/// emptied and had to be reseeded.
const REVISIT_AFTER: Duration = Duration::from_secs(60 * 60);

/// Recently-explored addresses remembered for suppression.
const RECENT_CAPACITY: usize = 512;

pub async fn run(lp: Arc<LocalPeer>) {
    let (tx, mut rx) = mpsc::channel::<Address>(EXPLORE_BUFFER_SIZE);
    let mut recent: LruCache<Address, Instant> =
        LruCache::new(NonZeroUsize::new(RECENT_CAPACITY).expect("capacity is non-zero"));

    seed_queue(&lp, &tx);

    let mut interval = tokio::time::interval(EXPLORE_FREQUENCY);

    loop {
        interval.tick().await;

        let mut reseeded = false;
        let candidate = match rx.try_recv() {
            Ok(candidate) => candidate,
            Err(_) => {
                debug!("candidate queue empty, reseeding");
                seed_queue(&lp, &tx);
                reseeded = true;
                match rx.try_recv() {
                    Ok(candidate) => candidate,
                    Err(_) => continue,
                }
            }
        };

        if candidate == lp.address() {
            continue;
        }

        if !reseeded {
            if let Some(visited) = recent.get(&candidate) {
                if visited.elapsed() < REVISIT_AFTER {
                    continue;
                }
            }
        }
        recent.put(candidate, Instant::now());

        info!(peer = %candidate, "exploring");
        match explore_peer(&lp, candidate).await {
            Ok(found) => {
                for entry in found {
                    if entry.address == lp.address() {
                        continue;
                    }

                    let known = lp.dht().has(&entry.address);
                    // Reinsert regardless; it keeps active entries fresh
                    if let Err(e) = lp.dht().insert(entry.clone()) {
                        debug!(error = %e, "explored entry rejected");
                        continue;
                    }

                    if !known {
                        info!(peer = %entry.address, "discovered new peer");
                        let _ = tx.try_send(entry.address);
                    }
                }
            }
            Err(e) => {
                warn!(peer = %candidate, error = %e, "explore failed");
            }
        }
    }
}

/// Ask one peer about three regions of the keyspace: somewhere random, the
/// peer itself, and us.
async fn explore_peer(lp: &Arc<LocalPeer>, target: Address) -> Result<Vec<Entry>> {
    let peer = lp.connect(target).await?;

    let mut found = Vec::new();

    debug!("exploring random");
    found.extend(peer.find_closest(&Address::random()).await?);

    found.push(peer.query(&target).await?);

    debug!("exploring closest to self");
    found.extend(peer.find_closest(&lp.address()).await?);

    Ok(found)
}

/// Refill the queue from our own table: entries closest to us and to a
/// random address, shuffled so exploration does not always walk the same
/// ring.
fn seed_queue(lp: &Arc<LocalPeer>, tx: &mpsc::Sender<Address>) {
    let mut entries = lp.dht().find_closest(&lp.address()).unwrap_or_default();
    entries.extend(lp.dht().find_closest(&Address::random()).unwrap_or_default());

    let mut seen = HashSet::new();
    let mut addresses: Vec<Address> = entries
        .into_iter()
        .map(|entry| entry.address)
        .filter(|addr| *addr != lp.address() && seen.insert(*addr))
        .collect();

    addresses.shuffle(&mut rand::thread_rng());

    for addr in addresses {
        if tx.try_send(addr).is_err() {
            break;
        }
    }
}
