//! Seed tracking.
//!
//! For every entry we mirror (and optionally our own), a seed manager
//! periodically polls the entry's known seeds for seeds *they* know about.
//! A candidate only survives if its own entry reciprocally lists the
//! tracked address under `seeding`; a one-sided claim is dropped, so a
//! peer cannot inflate another node's seed list by assertion.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::error::Result;
use crate::node::LocalPeer;

/// How often each tracked entry's seed set is re-examined.
pub const SEED_SEARCH_FREQUENCY: Duration = Duration::from_secs(5 * 60);

/// Handle on one tracked address's polling loop.
pub struct SeedManager {
    handle: JoinHandle<()>,
}

impl SeedManager {
    pub fn start(lp: Arc<LocalPeer>, track: Address) -> SeedManager {
        info!(peer = %track, "starting seed manager");
        let handle = tokio::spawn(run(lp, track));
        SeedManager { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn run(lp: Arc<LocalPeer>, track: Address) {
    let mut interval = tokio::time::interval(SEED_SEARCH_FREQUENCY);

    loop {
        interval.tick().await;
        if let Err(e) = find_seeds(&lp, track).await {
            warn!(peer = %track, error = %e, "seed search failed");
        }
    }
}

/// One polling round: ask every known seed of `track` for its view of the
/// entry, vet new candidates for reciprocity, and merge the survivors.
async fn find_seeds(lp: &Arc<LocalPeer>, track: Address) -> Result<()> {
    let mut entry = if track == lp.address() {
        lp.entry()
    } else {
        match lp.dht().query(&track)? {
            Some(entry) => entry,
            None => return Ok(()),
        }
    };

    debug!(peer = %track, seeds = entry.seeds.len(), "searching for new seeds");

    let known = entry.seeds.clone();
    let mut survivors: Vec<Address> = Vec::new();

    for seed in known {
        if seed == lp.address() || seed == track {
            continue;
        }

        let peer = match lp.connect(seed).await {
            Ok(peer) => peer,
            Err(e) => {
                debug!(seed = %seed, error = %e, "seed unreachable");
                continue;
            }
        };

        let reported = match peer.query(&track).await {
            Ok(entry) => entry,
            Err(e) => {
                debug!(seed = %seed, error = %e, "seed has no entry");
                continue;
            }
        };

        for candidate in reported.seeds {
            if candidate == lp.address()
                || candidate == track
                || entry.seeds.contains(&candidate)
                || survivors.contains(&candidate)
            {
                continue;
            }

            // Reciprocity check: the candidate's own entry must claim the
            // tracked address back.
            let candidate_entry = match lp.dht().query(&candidate)? {
                Some(entry) => entry,
                None => match peer.query(&candidate).await {
                    Ok(entry) => {
                        if let Err(e) = lp.dht().insert(entry.clone()) {
                            debug!(error = %e, "candidate entry rejected");
                            continue;
                        }
                        entry
                    }
                    Err(_) => continue,
                },
            };

            if candidate_entry.seeding.contains(&track) {
                survivors.push(candidate);
            } else {
                debug!(candidate = %candidate, "dropping unattested seed claim");
            }
        }
    }

    if survivors.is_empty() {
        return Ok(());
    }

    info!(peer = %track, found = survivors.len(), "found new seeds");
    if track == lp.address() {
        lp.merge_own_seeds(&survivors)?;
    } else {
        entry.merge_seeds(&survivors);
        lp.dht().insert(entry)?;
    }

    Ok(())
}
