//! Signed DHT entries.
//!
//! An entry is a node's self-description: who it is (address, public key),
//! how to reach it (public address, port), and what it carries (post count,
//! collection hash, seed lists). The owner signs a canonical byte form; any
//! node can verify an entry offline before trusting or forwarding it.
//!
//! The canonical form is frozen for interoperability:
//!
//! `name ∥ desc ∥ publicKey ∥ port ∥ publicAddress ∥ base58check(address)
//!  ∥ postCount ∥ seeding[0] ∥ seeding[1] ∥ ...`
//!
//! Integer fields are reinterpreted as their host-endian `i64` bytes. The
//! `seeds` list is deliberately absent: other nodes grow it by gossip, and
//! that must not invalidate the owner's signature. `seeding` is only ever
//! written by the owner, so it is covered.

use serde::{Deserialize, Serialize};

use crate::address::{Address, ADDRESS_BINARY_SIZE};
use crate::error::{Result, ZifError};
use crate::identity::{verify_signature, Keypair, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

pub const MAX_ENTRY_NAME_LENGTH: usize = 32;
pub const MAX_ENTRY_DESC_LENGTH: usize = 160;
pub const MAX_ENTRY_PUBLIC_ADDRESS_LENGTH: usize = 253;
pub const MAX_ENTRY_SEEDS: usize = 100_000;

/// Ceiling for an encoded entry travelling as a [`KeyValue`].
pub const MAX_VALUE_SIZE: usize = 10 * 1024;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub address: Address,
    pub name: String,
    pub desc: String,
    #[serde(rename = "publicAddress")]
    pub public_address: String,
    #[serde(rename = "publicKey")]
    pub public_key: Vec<u8>,
    #[serde(rename = "postCount")]
    pub post_count: i64,
    /// Unix seconds of the owner's last mutation.
    pub updated: u64,
    /// Owner's signature over [`Entry::canonical_bytes`].
    pub signature: Vec<u8>,
    /// Signature over the SHA3-256 root of the collection hash list.
    #[serde(rename = "collectionSig")]
    pub collection_sig: Vec<u8>,
    #[serde(rename = "collectionHash")]
    pub collection_hash: Vec<u8>,
    pub port: u16,
    /// Nodes mirroring this node's catalog. Grown by gossip, unsigned.
    pub seeds: Vec<Address>,
    /// Nodes whose catalogs this node mirrors. Owner-written, signed.
    pub seeding: Vec<Address>,
    /// Unix seconds this entry was last seen by the local observer.
    pub seen: u64,
}

impl Entry {
    /// Build an unsigned entry owned by `keypair`. The address is derived
    /// from the public key, never taken from the caller.
    pub fn new(keypair: &Keypair, name: &str, desc: &str, public_address: &str, port: u16) -> Self {
        Entry {
            address: keypair.address(),
            name: name.to_string(),
            desc: desc.to_string(),
            public_address: public_address.to_string(),
            public_key: keypair.public_key_bytes().to_vec(),
            port,
            ..Default::default()
        }
    }

    /// The byte form covered by the owner's signature. See the module docs
    /// for the field order; this layout is frozen.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.name.len()
                + self.desc.len()
                + self.public_key.len()
                + self.public_address.len()
                + 64
                + self.seeding.len() * ADDRESS_BINARY_SIZE,
        );

        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(self.desc.as_bytes());
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&(self.port as i64).to_ne_bytes());
        buf.extend_from_slice(self.public_address.as_bytes());
        buf.extend_from_slice(self.address.encode().as_bytes());
        buf.extend_from_slice(&self.post_count.to_ne_bytes());

        for addr in &self.seeding {
            buf.extend_from_slice(addr.as_bytes());
        }

        buf
    }

    /// Sign the canonical bytes with the owner's key, stamping `updated`.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.updated = unix_now();
        self.signature = keypair.sign(&self.canonical_bytes()).to_vec();
    }

    /// Check every invariant an entry must satisfy before it may enter the
    /// DHT: field caps, key/signature sizes, address derivation and the
    /// signature itself.
    pub fn verify(&self) -> Result<()> {
        if self.name.len() > MAX_ENTRY_NAME_LENGTH {
            return Err(ZifError::verify("name too long"));
        }

        if self.desc.len() > MAX_ENTRY_DESC_LENGTH {
            return Err(ZifError::verify("description too long"));
        }

        if self.public_address.is_empty() {
            return Err(ZifError::verify("public address must be set"));
        }

        // 253 is the maximum length of a domain name
        if self.public_address.len() > MAX_ENTRY_PUBLIC_ADDRESS_LENGTH {
            return Err(ZifError::verify("public address too long"));
        }

        if self.seeds.len() > MAX_ENTRY_SEEDS {
            return Err(ZifError::verify("too many seeds"));
        }

        if self.public_key.len() != PUBLIC_KEY_SIZE {
            return Err(ZifError::verify(format!(
                "public key is {} bytes, want {}",
                self.public_key.len(),
                PUBLIC_KEY_SIZE
            )));
        }

        if self.signature.len() != SIGNATURE_SIZE {
            return Err(ZifError::verify(format!(
                "signature is {} bytes, want {}",
                self.signature.len(),
                SIGNATURE_SIZE
            )));
        }

        // A stolen entry does an attacker no good: the address is bound to
        // the public key, so a mismatch means someone is wearing another
        // node's record.
        let key_bytes: [u8; PUBLIC_KEY_SIZE] = self
            .public_key
            .as_slice()
            .try_into()
            .expect("length checked above");
        if Address::derive(&key_bytes) != self.address {
            return Err(ZifError::verify("address does not match public key"));
        }

        if !verify_signature(&self.public_key, &self.canonical_bytes(), &self.signature) {
            return Err(ZifError::verify("signature check failed"));
        }

        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Entry> {
        crate::message::deserialize_bounded(data)
    }

    /// JSON form for the on-disk `entry.json`; everywhere else entries are
    /// binary.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Entry> {
        Ok(serde_json::from_str(data)?)
    }

    /// Union `incoming` into our seed list, preserving existing order and
    /// appending only unseen addresses. Returns true when anything was added.
    pub fn merge_seeds(&mut self, incoming: &[Address]) -> bool {
        let before = self.seeds.len();
        for addr in incoming {
            if !self.seeds.contains(addr) {
                self.seeds.push(*addr);
            }
        }
        self.seeds.len() != before
    }
}

/// Wraps `(address, encoded entry bytes)` for uniform DHT transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Address,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: Address, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    pub fn from_entry(entry: &Entry) -> Result<Self> {
        Ok(Self::new(entry.address, entry.encode()?))
    }

    pub fn valid(&self) -> bool {
        self.value.len() <= MAX_VALUE_SIZE
    }

    pub fn decode_entry(&self) -> Result<Entry> {
        if !self.valid() {
            return Err(ZifError::protocol("key-value payload too large"));
        }
        Entry::decode(&self.value)
    }
}

/// Sort entries in place by XOR distance to `target`, closest first.
pub fn sort_by_distance(entries: &mut [Entry], target: &Address) {
    entries.sort_by(|a, b| {
        let da = a.address.xor(target);
        let db = b.address.xor(target);
        da.cmp(&db)
    });
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn signed_entry(keypair: &Keypair) -> Entry {
        let mut entry = Entry::new(keypair, "node", "a test node", "127.0.0.1", 5050);
        entry.sign(keypair);
        entry
    }

    #[test]
    fn signed_entry_verifies() {
        let keypair = Keypair::generate();
        let entry = signed_entry(&keypair);
        entry.verify().unwrap();
    }

    #[test]
    fn tampering_any_signed_field_breaks_verify() {
        let keypair = Keypair::generate();

        let mut entry = signed_entry(&keypair);
        entry.name = "other".into();
        assert!(entry.verify().is_err());

        let mut entry = signed_entry(&keypair);
        entry.port += 1;
        assert!(entry.verify().is_err());

        let mut entry = signed_entry(&keypair);
        entry.post_count = 9;
        assert!(entry.verify().is_err());

        let mut entry = signed_entry(&keypair);
        entry.seeding.push(Address::random());
        assert!(entry.verify().is_err());
    }

    #[test]
    fn growing_seeds_keeps_signature_valid() {
        let keypair = Keypair::generate();
        let mut entry = signed_entry(&keypair);
        entry.seeds.push(Address::random());
        entry.verify().unwrap();
    }

    #[test]
    fn verify_rejects_wrong_address() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let mut entry = signed_entry(&keypair);
        entry.address = other.address();
        assert!(entry.verify().is_err());
    }

    #[test]
    fn verify_enforces_field_caps() {
        let keypair = Keypair::generate();

        let mut entry = signed_entry(&keypair);
        entry.name = "x".repeat(MAX_ENTRY_NAME_LENGTH + 1);
        entry.sign(&keypair);
        assert!(entry.verify().is_err());

        let mut entry = signed_entry(&keypair);
        entry.public_address = String::new();
        entry.sign(&keypair);
        assert!(entry.verify().is_err());

        let mut entry = signed_entry(&keypair);
        entry.signature = vec![0u8; 63];
        assert!(entry.verify().is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let keypair = Keypair::generate();
        let entry = signed_entry(&keypair);

        let encoded = entry.encode().unwrap();
        let decoded = Entry::decode(&encoded).unwrap();
        assert_eq!(decoded, entry);
        decoded.verify().unwrap();

        let json = entry.to_json().unwrap();
        assert_eq!(Entry::from_json(&json).unwrap(), entry);
    }

    #[test]
    fn merge_seeds_is_a_set_union() {
        let keypair = Keypair::generate();
        let mut entry = signed_entry(&keypair);

        let a = Address::random();
        let b = Address::random();
        entry.seeds = vec![a];

        assert!(entry.merge_seeds(&[a, b]));
        assert_eq!(entry.seeds, vec![a, b]);

        // Merging again changes nothing
        assert!(!entry.merge_seeds(&[a, b]));
        assert_eq!(entry.seeds, vec![a, b]);
    }

    #[test]
    fn sort_by_distance_is_monotonic() {
        let target = Address::random();
        let mut entries: Vec<Entry> = (0..8)
            .map(|_| {
                let kp = Keypair::generate();
                signed_entry(&kp)
            })
            .collect();

        sort_by_distance(&mut entries, &target);

        for pair in entries.windows(2) {
            assert!(pair[0].address.xor(&target) <= pair[1].address.xor(&target));
        }
    }

    #[test]
    fn key_value_size_cap() {
        let kv = KeyValue::new(Address::random(), vec![0u8; MAX_VALUE_SIZE]);
        assert!(kv.valid());
        let kv = KeyValue::new(Address::random(), vec![0u8; MAX_VALUE_SIZE + 1]);
        assert!(!kv.valid());
    }
}
