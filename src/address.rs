//! Node addresses.
//!
//! A Zif address is a 20-byte digest of the node's Ed25519 public key:
//! `BLAKE2b-160(SHA3-256(public_key))`. Hashing the key instead of using it
//! directly keeps the address format stable if the signature scheme ever
//! changes. Addresses double as Kademlia identifiers: the XOR distance
//! between two addresses picks the k-bucket.
//!
//! For humans an address is rendered as Base58-Check with version byte
//! `0x51`, which makes every encoded address start with `Z`.

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::error::{Result, ZifError};

/// Raw size of an address in bytes.
pub const ADDRESS_BINARY_SIZE: usize = 20;

/// Base58-Check version byte; decodes to a leading `Z`.
pub const ADDRESS_VERSION: u8 = 0x51;

/// Number of k-buckets: one per bit of an address.
pub const ADDRESS_BITS: usize = ADDRESS_BINARY_SIZE * 8;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_BINARY_SIZE]);

impl Address {
    /// Derive an address from a 32-byte Ed25519 public key.
    pub fn derive(public_key: &[u8; 32]) -> Self {
        let first = Sha3_256::digest(public_key);

        let mut blake = Blake2bVar::new(ADDRESS_BINARY_SIZE).expect("20 is a valid blake2b size");
        blake.update(first.as_slice());
        let mut out = [0u8; ADDRESS_BINARY_SIZE];
        blake
            .finalize_variable(&mut out)
            .expect("output buffer matches digest size");

        Self(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDRESS_BINARY_SIZE {
            return Err(ZifError::InvalidAddress(format!(
                "expected {} bytes, got {}",
                ADDRESS_BINARY_SIZE,
                bytes.len()
            )));
        }
        let mut raw = [0u8; ADDRESS_BINARY_SIZE];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// An address derived from 32 random bytes, used to probe arbitrary
    /// regions of the keyspace during exploration.
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::derive(&seed)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_BINARY_SIZE] {
        &self.0
    }

    #[inline]
    pub fn xor(&self, other: &Address) -> Address {
        let mut out = [0u8; ADDRESS_BINARY_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Address(out)
    }

    /// Leading zero bits, clamped to `ADDRESS_BITS - 1`. Applied to an XOR
    /// distance this is the k-bucket index, so the all-zero distance (self)
    /// lands in the last bucket rather than out of range.
    pub fn leading_zero_bits(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ADDRESS_BITS - 1
    }

    /// Base58-Check string with the Zif version byte.
    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(1 + ADDRESS_BINARY_SIZE);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(&self.0);
        bs58::encode(payload).with_check().into_string()
    }

    /// Decode a Base58-Check string back into an address.
    pub fn decode(value: &str) -> Result<Self> {
        let data = bs58::decode(value)
            .with_check(None)
            .into_vec()
            .map_err(|_| ZifError::InvalidAddress(value.to_string()))?;

        if data.len() != 1 + ADDRESS_BINARY_SIZE || data[0] != ADDRESS_VERSION {
            return Err(ZifError::InvalidAddress(value.to_string()));
        }

        Self::from_bytes(&data[1..])
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable_and_20_bytes() {
        let key = [0xAAu8; 32];
        let a = Address::derive(&key);
        let b = Address::derive(&key);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), 20);
    }

    #[test]
    fn encoded_address_starts_with_z_and_round_trips() {
        let key = [0xAAu8; 32];
        let addr = Address::derive(&key);
        let encoded = addr.encode();
        assert!(encoded.starts_with('Z'), "got {encoded}");

        let decoded = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Address::decode("not-base58-0OIl").is_err());
        // Valid base58check but wrong payload size
        let short = bs58::encode([ADDRESS_VERSION, 1, 2, 3])
            .with_check()
            .into_string();
        assert!(Address::decode(&short).is_err());
    }

    #[test]
    fn xor_metric() {
        let a = Address::derive(&[1u8; 32]);
        let b = Address::derive(&[2u8; 32]);

        assert_eq!(a.xor(&a).as_bytes(), &[0u8; 20]);
        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn self_distance_lands_in_last_bucket() {
        let a = Address::derive(&[3u8; 32]);
        assert_eq!(a.xor(&a).leading_zero_bits(), ADDRESS_BITS - 1);
    }

    #[test]
    fn leading_zero_bits_counts_prefix() {
        let mut raw = [0u8; 20];
        raw[1] = 0b0001_0000;
        let addr = Address::from_bytes(&raw).unwrap();
        assert_eq!(addr.leading_zero_bits(), 11);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let lo = Address::from_bytes(&[0u8; 20]).unwrap();
        let mut hi_raw = [0u8; 20];
        hi_raw[0] = 1;
        let hi = Address::from_bytes(&hi_raw).unwrap();
        assert!(lo < hi);
    }
}
