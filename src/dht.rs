//! DHT facade.
//!
//! A thin, clonable front over [`NetDb`]: insert, query, closest-K, and
//! table persistence. Opening the DHT re-inserts the most recently stored
//! entries so the bucket table is warm straight after a restart.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::address::Address;
use crate::entry::Entry;
use crate::error::Result;
use crate::netdb::{NetDb, BUCKET_SIZE};

#[derive(Clone)]
pub struct Dht {
    db: Arc<NetDb>,
}

impl Dht {
    pub fn open(addr: Address, path: impl AsRef<Path>) -> Result<Dht> {
        let db = NetDb::open(addr, path)?;

        // Re-warm the routing table with whatever we knew before the
        // restart; inserts that fail verification are simply dropped.
        let latest = db.query_latest(BUCKET_SIZE)?;
        for entry in latest {
            if let Err(e) = db.insert(entry) {
                debug!(error = %e, "stale entry skipped during warm-up");
            }
        }

        Ok(Dht { db: Arc::new(db) })
    }

    pub fn address(&self) -> Address {
        self.db.address()
    }

    pub fn insert(&self, entry: Entry) -> Result<()> {
        self.db.insert(entry)
    }

    pub fn query(&self, addr: &Address) -> Result<Option<Entry>> {
        self.db.query(addr)
    }

    pub fn has(&self, addr: &Address) -> bool {
        matches!(self.db.query(addr), Ok(Some(_)))
    }

    pub fn find_closest(&self, addr: &Address) -> Result<Vec<Entry>> {
        self.db.find_closest(addr)
    }

    pub fn search(&self, query: &str) -> Result<Vec<Entry>> {
        self.db.search(query)
    }

    pub fn seeds_of(&self, addr: &Address) -> Result<Vec<Address>> {
        self.db.seeds_of(addr)
    }

    pub fn len(&self) -> Result<usize> {
        self.db.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.db.is_empty()
    }

    pub fn save_table(&self, path: impl AsRef<Path>) -> Result<()> {
        self.db.save_table(path)
    }

    pub fn load_table(&self, path: impl AsRef<Path>) -> Result<()> {
        self.db.load_table(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn reopen_warms_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.db");
        let self_addr = Address::derive(&[9u8; 32]);

        let keypair = Keypair::generate();
        let mut entry = Entry::new(&keypair, "warm", "", "10.1.1.1", 5050);
        entry.sign(&keypair);

        {
            let dht = Dht::open(self_addr, &path).unwrap();
            dht.insert(entry.clone()).unwrap();
        }

        let reopened = Dht::open(self_addr, &path).unwrap();
        assert!(reopened.has(&entry.address));
        let closest = reopened.find_closest(&entry.address).unwrap();
        assert_eq!(closest.len(), 1);
    }
}
