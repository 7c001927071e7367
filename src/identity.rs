//! Keypairs and identity persistence.
//!
//! A node's identity is an Ed25519 keypair; everything else (the address,
//! the signed entry) derives from it. The private key is the only thing
//! persisted. `identity.dat` holds the 64-byte keypair encoding, written
//! with owner-read-only permissions.

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::address::Address;
use crate::error::{Result, ZifError};

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;
const KEYPAIR_SIZE: usize = 64;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn address(&self) -> Address {
        Address::derive(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Persist the keypair. The file is chmod'd to owner-read-only; losing
    /// it means losing the node's address.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.signing_key.to_keypair_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))?;
        }

        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let bytes: [u8; KEYPAIR_SIZE] = raw
            .as_slice()
            .try_into()
            .map_err(|_| ZifError::verify(format!("identity file is {} bytes, want 64", raw.len())))?;
        let signing_key = SigningKey::from_keypair_bytes(&bytes)
            .map_err(|e| ZifError::verify(format!("bad identity file: {e}")))?;
        Ok(Self { signing_key })
    }

    /// Load the identity at `path`, generating and saving a fresh one on
    /// first launch.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Keypair::load(path)
        } else {
            let keypair = Keypair::generate();
            keypair.save(path)?;
            Ok(keypair)
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against a raw 32-byte public key.
/// Malformed keys or signatures simply fail verification.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_SIZE]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
        return false;
    };
    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"zif");
        assert!(verify_signature(&keypair.public_key_bytes(), b"zif", &sig));
        assert!(!verify_signature(&keypair.public_key_bytes(), b"fiz", &sig));
    }

    #[test]
    fn verify_rejects_malformed_inputs() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"zif");
        assert!(!verify_signature(&[0u8; 7], b"zif", &sig));
        assert!(!verify_signature(&keypair.public_key_bytes(), b"zif", &sig[..32]));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.dat");

        let keypair = Keypair::generate();
        keypair.save(&path).unwrap();

        let loaded = Keypair::load(&path).unwrap();
        assert_eq!(loaded.public_key_bytes(), keypair.public_key_bytes());
        assert_eq!(loaded.address(), keypair.address());
    }

    #[test]
    fn load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.dat");

        let first = Keypair::load_or_generate(&path).unwrap();
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.address(), second.address());
    }
}
