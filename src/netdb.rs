//! The network database: every entry this node has ever validated.
//!
//! Two structures work together. A durable SQLite store holds full entry
//! records (plus a `seed` join table and a full-text index over name and
//! description), and an in-memory Kademlia bucket table holds just
//! addresses for fast closest-K lookup. Bucket membership implies a store
//! row; the reverse is not required, as the store can hold far more than the
//! table's 160×20 addresses.
//!
//! Buckets behave LRU-of-seen: touching an address moves it to the front
//! of its bucket, and a full bucket evicts its least recently seen tail.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::address::{Address, ADDRESS_BINARY_SIZE, ADDRESS_BITS};
use crate::entry::Entry;
use crate::error::{Result, ZifError};

/// K: addresses per bucket, and the result cap for closest-K queries.
pub const BUCKET_SIZE: usize = 20;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entry (
    id INTEGER PRIMARY KEY NOT NULL,
    address TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    "desc" TEXT,
    publicAddress TEXT NOT NULL,
    port INTEGER,
    publicKey BLOB NOT NULL,
    signature BLOB,
    collectionSig BLOB,
    collectionHash BLOB,
    postCount INTEGER,
    seedCount INTEGER,
    seedingCount INTEGER,
    updated INTEGER,
    seen INTEGER,
    seeds BLOB,
    seeding BLOB
);

CREATE TABLE IF NOT EXISTS seed (
    id INTEGER PRIMARY KEY NOT NULL,
    seed_id INTEGER NOT NULL,
    for_id INTEGER NOT NULL,
    UNIQUE(seed_id, for_id) ON CONFLICT REPLACE
);

CREATE VIRTUAL TABLE IF NOT EXISTS ftsEntry USING fts4(address, name, "desc");

CREATE INDEX IF NOT EXISTS addressIndex ON entry(address);
"#;

const SQL_INSERT_ENTRY: &str = r#"
INSERT INTO entry (
    address, name, "desc", publicAddress, port, publicKey, signature,
    collectionSig, collectionHash, postCount, seedCount, seedingCount,
    updated, seen, seeds, seeding
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
"#;

const SQL_UPDATE_ENTRY: &str = r#"
UPDATE entry SET
    name = ?2, "desc" = ?3, publicAddress = ?4, port = ?5, publicKey = ?6,
    signature = ?7, collectionSig = ?8, collectionHash = ?9, postCount = ?10,
    seedCount = ?11, seedingCount = ?12, updated = ?13, seen = ?14,
    seeds = ?15, seeding = ?16
WHERE address = ?1
"#;

const SQL_QUERY_ADDRESS: &str = r#"
SELECT address, name, "desc", publicAddress, port, publicKey, signature,
       collectionSig, collectionHash, postCount, updated, seen, seeds, seeding
FROM entry WHERE address = ?1
"#;

const SQL_QUERY_LATEST: &str = r#"
SELECT address FROM entry ORDER BY id DESC LIMIT ?1
"#;

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let address_str: String = row.get(0)?;
    let address = Address::decode(&address_str).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad address {address_str}").into(),
        )
    })?;

    let seeds_blob: Vec<u8> = row.get(12)?;
    let seeding_blob: Vec<u8> = row.get(13)?;

    Ok(Entry {
        address,
        name: row.get(1)?,
        desc: row.get(2)?,
        public_address: row.get(3)?,
        port: row.get::<_, i64>(4)? as u16,
        public_key: row.get(5)?,
        signature: row.get(6)?,
        collection_sig: row.get(7)?,
        collection_hash: row.get(8)?,
        post_count: row.get(9)?,
        updated: row.get::<_, i64>(10)? as u64,
        seen: row.get::<_, i64>(11)? as u64,
        seeds: decode_address_blob(&seeds_blob),
        seeding: decode_address_blob(&seeding_blob),
    })
}

fn encode_address_blob(addrs: &[Address]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(addrs.len() * ADDRESS_BINARY_SIZE);
    for addr in addrs {
        blob.extend_from_slice(addr.as_bytes());
    }
    blob
}

fn decode_address_blob(blob: &[u8]) -> Vec<Address> {
    blob.chunks_exact(ADDRESS_BINARY_SIZE)
        .filter_map(|chunk| Address::from_bytes(chunk).ok())
        .collect()
}

pub struct NetDb {
    addr: Address,
    conn: Mutex<Connection>,
    table: Mutex<Vec<Vec<Address>>>,
}

impl NetDb {
    pub fn open(addr: Address, path: impl AsRef<Path>) -> Result<NetDb> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(NetDb {
            addr,
            conn: Mutex::new(conn),
            table: Mutex::new(vec![Vec::with_capacity(BUCKET_SIZE); ADDRESS_BITS]),
        })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Number of entries in the durable store.
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("netdb lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entry", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Total addresses currently held across all buckets.
    pub fn table_len(&self) -> usize {
        self.table
            .lock()
            .expect("table lock poisoned")
            .iter()
            .map(Vec::len)
            .sum()
    }

    fn bucket_index(&self, addr: &Address) -> usize {
        addr.xor(&self.addr).leading_zero_bits()
    }

    /// Move `addr` to the front of its bucket, evicting the tail when the
    /// bucket is already full of other addresses.
    pub fn table_touch(&self, addr: Address) {
        let index = self.bucket_index(&addr);
        let mut table = self.table.lock().expect("table lock poisoned");
        let bucket = &mut table[index];

        if let Some(pos) = bucket.iter().position(|a| *a == addr) {
            bucket.remove(pos);
        } else if bucket.len() == BUCKET_SIZE {
            bucket.pop();
        }

        bucket.insert(0, addr);
    }

    /// Insert an entry: verify it, upsert the durable row, and touch the
    /// bucket table. When a row already exists the newer record wins on
    /// `updated`; on a tie the seed sets are unioned so gossip can only
    /// grow knowledge.
    pub fn insert(&self, mut entry: Entry) -> Result<()> {
        entry.verify()?;

        match self.query_store(&entry.address)? {
            None => {
                self.insert_row(&entry)?;
            }
            Some(existing) if entry.updated > existing.updated => {
                self.update_row(&entry)?;
            }
            Some(existing) if entry.updated == existing.updated => {
                let mut merged = existing;
                if merged.merge_seeds(&entry.seeds) {
                    self.update_row(&merged)?;
                }
            }
            // Stored record is newer; keep it.
            Some(_) => {}
        }

        self.table_touch(entry.address);
        Ok(())
    }

    fn insert_row(&self, entry: &Entry) -> Result<()> {
        {
            let conn = self.conn.lock().expect("netdb lock poisoned");
            exec_entry(&conn, SQL_INSERT_ENTRY, entry)?;
            conn.execute(
                "INSERT INTO ftsEntry (address, name, \"desc\") VALUES (?1, ?2, ?3)",
                params![entry.address.encode(), entry.name, entry.desc],
            )?;
        }
        self.record_seed_relations(entry)?;
        Ok(())
    }

    fn update_row(&self, entry: &Entry) -> Result<()> {
        {
            let conn = self.conn.lock().expect("netdb lock poisoned");
            exec_entry(&conn, SQL_UPDATE_ENTRY, entry)?;
            conn.execute(
                "DELETE FROM ftsEntry WHERE address = ?1",
                params![entry.address.encode()],
            )?;
            conn.execute(
                "INSERT INTO ftsEntry (address, name, \"desc\") VALUES (?1, ?2, ?3)",
                params![entry.address.encode(), entry.name, entry.desc],
            )?;
        }
        self.record_seed_relations(entry)?;
        Ok(())
    }

    /// Mirror the entry's seed lists into the `seed` join table. Rows are
    /// keyed on the entry table's integer ids; addresses we have no row for
    /// yet are skipped and picked up on a later insert.
    fn record_seed_relations(&self, entry: &Entry) -> Result<()> {
        let conn = self.conn.lock().expect("netdb lock poisoned");

        let entry_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM entry WHERE address = ?1",
                params![entry.address.encode()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(entry_id) = entry_id else {
            return Ok(());
        };

        let mut lookup = conn.prepare_cached("SELECT id FROM entry WHERE address = ?1")?;
        let mut insert =
            conn.prepare_cached("INSERT OR IGNORE INTO seed (seed_id, for_id) VALUES (?1, ?2)")?;

        for seed in &entry.seeds {
            if let Some(seed_id) = lookup
                .query_row(params![seed.encode()], |row| row.get::<_, i64>(0))
                .optional()?
            {
                insert.execute(params![seed_id, entry_id])?;
            }
        }

        for target in &entry.seeding {
            if let Some(for_id) = lookup
                .query_row(params![target.encode()], |row| row.get::<_, i64>(0))
                .optional()?
            {
                insert.execute(params![entry_id, for_id])?;
            }
        }

        Ok(())
    }

    fn query_store(&self, addr: &Address) -> Result<Option<Entry>> {
        let conn = self.conn.lock().expect("netdb lock poisoned");
        let entry = conn
            .query_row(SQL_QUERY_ADDRESS, params![addr.encode()], |row| {
                read_entry_row(row)
            })
            .optional()?;
        Ok(entry)
    }

    /// Look up an entry by address. A hit also touches the bucket table so
    /// popular entries stay visible to closest-K queries.
    pub fn query(&self, addr: &Address) -> Result<Option<Entry>> {
        let entry = self.query_store(addr)?;
        if let Some(entry) = &entry {
            self.table_touch(entry.address);
        }
        Ok(entry)
    }

    /// Up to K entries close to `addr`: the home bucket first, then
    /// widening symmetrically until K are collected or the table is
    /// exhausted. Callers needing sorted output sort by XOR distance.
    pub fn find_closest(&self, addr: &Address) -> Result<Vec<Entry>> {
        let index = self.bucket_index(addr);

        let candidates: Vec<Address> = {
            let table = self.table.lock().expect("table lock poisoned");
            let mut picked = Vec::with_capacity(BUCKET_SIZE);

            'widen: for delta in 0..ADDRESS_BITS {
                let below = index.checked_sub(delta);
                let above = if delta == 0 { None } else { index.checked_add(delta) };

                for bucket_index in below.into_iter().chain(above) {
                    if bucket_index >= ADDRESS_BITS {
                        continue;
                    }
                    for addr in &table[bucket_index] {
                        picked.push(*addr);
                        if picked.len() == BUCKET_SIZE {
                            break 'widen;
                        }
                    }
                }

                if below.is_none() && index + delta >= ADDRESS_BITS {
                    break;
                }
            }

            picked
        };

        let mut entries = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.query_store(&candidate) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(address = %candidate, error = %e, "skipping unreadable entry"),
            }
        }

        Ok(entries)
    }

    /// Addresses of the most recently stored entries, used to re-warm the
    /// bucket table after a restart.
    pub fn query_latest(&self, limit: usize) -> Result<Vec<Entry>> {
        let addresses: Vec<String> = {
            let conn = self.conn.lock().expect("netdb lock poisoned");
            let mut stmt = conn.prepare(SQL_QUERY_LATEST)?;
            let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut entries = Vec::with_capacity(addresses.len());
        for encoded in addresses {
            if let Ok(addr) = Address::decode(&encoded) {
                if let Some(entry) = self.query_store(&addr)? {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Addresses seeding `addr`, from the join table.
    pub fn seeds_of(&self, addr: &Address) -> Result<Vec<Address>> {
        self.seed_join(addr, "seed.seed_id", "seed.for_id")
    }

    /// Addresses that `addr` claims to be seeding.
    pub fn seeding_of(&self, addr: &Address) -> Result<Vec<Address>> {
        self.seed_join(addr, "seed.for_id", "seed.seed_id")
    }

    fn seed_join(&self, addr: &Address, select_on: &str, filter_on: &str) -> Result<Vec<Address>> {
        let conn = self.conn.lock().expect("netdb lock poisoned");
        let sql = format!(
            "SELECT entry.address FROM entry JOIN seed ON entry.id = {select_on} \
             WHERE {filter_on} = (SELECT id FROM entry WHERE address = ?1)"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![addr.encode()], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for encoded in rows {
            if let Ok(addr) = Address::decode(&encoded?) {
                out.push(addr);
            }
        }
        Ok(out)
    }

    /// Full-text search over entry names and descriptions.
    pub fn search(&self, query: &str) -> Result<Vec<Entry>> {
        let addresses: Vec<String> = {
            let conn = self.conn.lock().expect("netdb lock poisoned");
            let mut stmt =
                conn.prepare("SELECT address FROM ftsEntry WHERE ftsEntry MATCH ?1 LIMIT 50")?;
            let rows = stmt.query_map(params![query], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut entries = Vec::new();
        for encoded in addresses {
            if let Ok(addr) = Address::decode(&encoded) {
                if let Some(entry) = self.query_store(&addr)? {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Persist the bucket table as a JSON blob.
    pub fn save_table(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let table = self.table.lock().expect("table lock poisoned");
        let data = serde_json::to_vec(&*table)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load a previously saved bucket table. Buckets are clamped to K and
    /// malformed files are rejected rather than partially applied.
    pub fn load_table(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = std::fs::read(path)?;
        let mut loaded: Vec<Vec<Address>> = serde_json::from_slice(&data)?;

        if loaded.len() != ADDRESS_BITS {
            return Err(ZifError::verify("bucket table has wrong shape"));
        }
        for bucket in &mut loaded {
            bucket.truncate(BUCKET_SIZE);
        }

        *self.table.lock().expect("table lock poisoned") = loaded;
        Ok(())
    }
}

fn exec_entry(conn: &Connection, sql: &str, entry: &Entry) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        params![
            entry.address.encode(),
            entry.name,
            entry.desc,
            entry.public_address,
            entry.port as i64,
            entry.public_key,
            entry.signature,
            entry.collection_sig,
            entry.collection_hash,
            entry.post_count,
            entry.seeds.len() as i64,
            entry.seeding.len() as i64,
            entry.updated as i64,
            entry.seen as i64,
            encode_address_blob(&entry.seeds),
            encode_address_blob(&entry.seeding),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn netdb() -> (NetDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let self_addr = Address::derive(&[0u8; 32]);
        let db = NetDb::open(self_addr, dir.path().join("peers.db")).unwrap();
        (db, dir)
    }

    fn entry_for(keypair: &Keypair) -> Entry {
        let mut entry = Entry::new(keypair, "peer", "desc words", "10.0.0.1", 5050);
        entry.sign(keypair);
        entry
    }

    #[test]
    fn insert_then_query_round_trips() {
        let (db, _dir) = netdb();
        let keypair = Keypair::generate();
        let entry = entry_for(&keypair);

        db.insert(entry.clone()).unwrap();

        let found = db.query(&entry.address).unwrap().unwrap();
        assert_eq!(found, entry);
        found.verify().unwrap();
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn insert_rejects_invalid_entries() {
        let (db, _dir) = netdb();
        let keypair = Keypair::generate();
        let mut entry = entry_for(&keypair);
        entry.name = "changed after signing".into();

        assert!(db.insert(entry).is_err());
        assert_eq!(db.len().unwrap(), 0);
        assert_eq!(db.table_len(), 0);
    }

    #[test]
    fn newer_updated_replaces_older_is_kept() {
        let (db, _dir) = netdb();
        let keypair = Keypair::generate();

        let mut v1 = entry_for(&keypair);
        v1.updated = 100;
        v1.signature = keypair.sign(&v1.canonical_bytes()).to_vec();
        db.insert(v1.clone()).unwrap();

        let mut v2 = v1.clone();
        v2.desc = "newer".into();
        v2.updated = 200;
        v2.signature = keypair.sign(&v2.canonical_bytes()).to_vec();
        db.insert(v2.clone()).unwrap();
        assert_eq!(db.query(&v2.address).unwrap().unwrap().desc, "newer");

        // Replaying the stale record does not regress the store
        db.insert(v1).unwrap();
        assert_eq!(db.query(&v2.address).unwrap().unwrap().desc, "newer");
    }

    #[test]
    fn equal_updated_unions_seed_sets() {
        let (db, _dir) = netdb();
        let keypair = Keypair::generate();

        let seed_a = Address::random();
        let seed_b = Address::random();

        let mut first = entry_for(&keypair);
        first.updated = 100;
        first.seeds = vec![seed_a];
        first.signature = keypair.sign(&first.canonical_bytes()).to_vec();
        db.insert(first.clone()).unwrap();

        let mut second = first.clone();
        second.seeds = vec![seed_b];
        db.insert(second).unwrap();

        let merged = db.query(&first.address).unwrap().unwrap();
        assert_eq!(merged.seeds, vec![seed_a, seed_b]);
    }

    #[test]
    fn double_insert_is_idempotent() {
        let (db, _dir) = netdb();
        let keypair = Keypair::generate();
        let entry = entry_for(&keypair);

        db.insert(entry.clone()).unwrap();
        db.insert(entry.clone()).unwrap();

        assert_eq!(db.len().unwrap(), 1);
        assert_eq!(db.table_len(), 1);
        assert_eq!(db.query(&entry.address).unwrap().unwrap(), entry);
    }

    #[test]
    fn table_touch_is_lru_with_bounded_buckets() {
        let self_addr = Address::derive(&[0u8; 32]);
        let dir = tempfile::tempdir().unwrap();
        let db = NetDb::open(self_addr, dir.path().join("peers.db")).unwrap();

        // Generate addresses that all land in the same bucket as each other
        let mut in_bucket = Vec::new();
        let mut attempt = 0u32;
        while in_bucket.len() < BUCKET_SIZE + 5 {
            let mut seed = [0u8; 32];
            seed[..4].copy_from_slice(&attempt.to_be_bytes());
            attempt += 1;
            let addr = Address::derive(&seed);
            if addr.xor(&self_addr).leading_zero_bits() == 0 {
                in_bucket.push(addr);
            }
        }

        for addr in &in_bucket {
            db.table_touch(*addr);
        }
        // Bucket stays capped at K
        assert_eq!(db.table_len(), BUCKET_SIZE);

        // Touching an existing address moves it to the front without growth
        let favourite = in_bucket[in_bucket.len() - 3];
        db.table_touch(favourite);
        assert_eq!(db.table_len(), BUCKET_SIZE);

        let table = db.table.lock().unwrap();
        assert_eq!(table[0][0], favourite);
        let unique: std::collections::HashSet<_> = table[0].iter().collect();
        assert_eq!(unique.len(), table[0].len());
    }

    #[test]
    fn find_closest_returns_store_entries_sorted_by_distance() {
        let (db, _dir) = netdb();

        let mut inserted = Vec::new();
        for _ in 0..8 {
            let keypair = Keypair::generate();
            let entry = entry_for(&keypair);
            db.insert(entry.clone()).unwrap();
            inserted.push(entry);
        }

        let target = Address::random();
        let mut closest = db.find_closest(&target).unwrap();
        assert!(closest.len() <= BUCKET_SIZE);
        assert_eq!(closest.len(), inserted.len());

        crate::entry::sort_by_distance(&mut closest, &target);
        for pair in closest.windows(2) {
            assert!(pair[0].address.xor(&target) <= pair[1].address.xor(&target));
        }
    }

    #[test]
    fn save_and_load_table() {
        let (db, dir) = netdb();
        let keypair = Keypair::generate();
        let entry = entry_for(&keypair);
        db.insert(entry.clone()).unwrap();

        let table_path = dir.path().join("table.dat");
        db.save_table(&table_path).unwrap();

        let db2 = NetDb::open(db.address(), dir.path().join("peers2.db")).unwrap();
        db2.load_table(&table_path).unwrap();
        assert_eq!(db2.table_len(), 1);
    }

    #[test]
    fn seed_join_table_tracks_relations() {
        let (db, _dir) = netdb();

        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();

        let entry_a = entry_for(&kp_a);
        db.insert(entry_a.clone()).unwrap();

        // B announces that it seeds A
        let mut entry_b = Entry::new(&kp_b, "seeder", "", "10.0.0.2", 5051);
        entry_b.seeding = vec![entry_a.address];
        entry_b.sign(&kp_b);
        db.insert(entry_b.clone()).unwrap();

        assert_eq!(db.seeds_of(&entry_a.address).unwrap(), vec![entry_b.address]);
        assert_eq!(db.seeding_of(&entry_b.address).unwrap(), vec![entry_a.address]);
    }

    #[test]
    fn fts_search_finds_by_name_and_desc() {
        let (db, _dir) = netdb();
        let keypair = Keypair::generate();
        let mut entry = Entry::new(&keypair, "archive", "rare torrents here", "10.0.0.3", 5050);
        entry.sign(&keypair);
        db.insert(entry.clone()).unwrap();

        let hits = db.search("torrents").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].address, entry.address);

        assert!(db.search("nosuchword").unwrap().is_empty());
    }

    #[test]
    fn query_latest_warms_restart() {
        let (db, _dir) = netdb();
        for _ in 0..3 {
            let keypair = Keypair::generate();
            db.insert(entry_for(&keypair)).unwrap();
        }
        let latest = db.query_latest(20).unwrap();
        assert_eq!(latest.len(), 3);
    }
}
