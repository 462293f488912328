//! Signing backend for heartbeats and other signed records.
//!
//! Real deployments sign with Ed25519; the simulated backend exists for
//! tests and local development and must be selected explicitly — it is
//! never the default when a configuration omits the `signer` field.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SignerError;

/// A fixed-size signature, hex-encoded as 64 bytes on the wire regardless
/// of which backend produced it.
pub type SignatureBytes = [u8; 64];

/// Anything that can sign bytes on behalf of a node identity.
pub trait Signer: Send + Sync {
    fn node_id(&self) -> &str;
    fn public_key_hex(&self) -> String;
    fn sign(&self, message: &[u8]) -> SignatureBytes;
}

/// Anything that can verify a signature produced by the matching `Signer`.
pub trait Verifier: Send + Sync {
    fn verify(&self, public_key_hex: &str, message: &[u8], signature: &SignatureBytes) -> bool;
}

/// Production signing backend backed by a persisted Ed25519 keypair.
pub struct Ed25519Signer {
    node_id: String,
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Load the keypair from `path`, or generate and persist a new one.
    ///
    /// A present-but-corrupt key file is a hard `SignerError`: silently
    /// regenerating an identity would desynchronize a validator set that
    /// already knows this node's public key.
    pub fn load_or_create(node_id: impl Into<String>, path: &Path) -> Result<Self, SignerError> {
        let node_id = node_id.into();
        if path.exists() {
            let bytes = fs::read(path).map_err(|e| SignerError::CorruptKeyFile {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
            let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| SignerError::CorruptKeyFile {
                path: path.display().to_string(),
                detail: format!("expected 32 bytes, found {}", bytes.len()),
            })?;
            let signing_key = SigningKey::from_bytes(&seed);
            return Ok(Self { node_id, signing_key });
        }

        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(path, seed).map_err(|e| SignerError::CorruptKeyFile {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self { node_id, signing_key })
    }

    pub fn default_key_path(data_dir: &Path) -> PathBuf {
        data_dir.join("node_key.bin")
    }
}

impl Signer for Ed25519Signer {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Stateless verifier for Ed25519 public keys presented as hex strings.
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, public_key_hex: &str, message: &[u8], signature: &SignatureBytes) -> bool {
        let Ok(pk_bytes) = hex::decode(public_key_hex) else { return false };
        let Ok(pk_arr): Result<[u8; 32], _> = pk_bytes.as_slice().try_into() else { return false };
        let Ok(vk) = VerifyingKey::from_bytes(&pk_arr) else { return false };
        let sig = Signature::from_bytes(signature);
        vk.verify(message, &sig).is_ok()
    }
}

/// Non-cryptographic signing backend: a deterministic SHA-256 tag over
/// the signed bytes, keyed by the node id rather than a secret. Its
/// paired verifier accepts any tag produced the same way — there is no
/// secrecy here, which is the point: selecting this backend is an
/// explicit opt-out of real authentication, logged once at construction.
pub struct SimulatedSigner {
    node_id: String,
}

impl SimulatedSigner {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        tracing::warn!(node_id = %node_id, "simulated signer selected: heartbeats are not cryptographically authenticated");
        Self { node_id }
    }

    fn tag(node_id: &str, message: &[u8]) -> SignatureBytes {
        let mut hasher = Sha256::new();
        hasher.update(node_id.as_bytes());
        hasher.update(message);
        let digest = hasher.finalize();
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&digest);
        out[32..].copy_from_slice(&digest);
        out
    }
}

impl Signer for SimulatedSigner {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn public_key_hex(&self) -> String {
        // the "public key" for the simulated backend is just the node id,
        // hex-encoded so it round-trips through the same wire field.
        hex::encode(self.node_id.as_bytes())
    }

    fn sign(&self, message: &[u8]) -> SignatureBytes {
        Self::tag(&self.node_id, message)
    }
}

pub struct SimulatedVerifier;

impl Verifier for SimulatedVerifier {
    fn verify(&self, public_key_hex: &str, message: &[u8], signature: &SignatureBytes) -> bool {
        let Ok(node_id_bytes) = hex::decode(public_key_hex) else { return false };
        let Ok(node_id) = String::from_utf8(node_id_bytes) else { return false };
        &SimulatedSigner::tag(&node_id, message) == signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_round_trip() {
        let dir = std::env::temp_dir().join(format!("pulsecore-test-{}", std::process::id()));
        let path = dir.join("key.bin");
        let signer = Ed25519Signer::load_or_create("n1", &path).unwrap();
        let sig = signer.sign(b"hello");
        assert!(Ed25519Verifier.verify(&signer.public_key_hex(), b"hello", &sig));
        assert!(!Ed25519Verifier.verify(&signer.public_key_hex(), b"tampered", &sig));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn ed25519_persists_identity_across_reloads() {
        let dir = std::env::temp_dir().join(format!("pulsecore-test-{}", std::process::id() + 1));
        let path = dir.join("key.bin");
        let a = Ed25519Signer::load_or_create("n1", &path).unwrap();
        let b = Ed25519Signer::load_or_create("n1", &path).unwrap();
        assert_eq!(a.public_key_hex(), b.public_key_hex());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn simulated_signer_always_verifies_matching_tag() {
        let signer = SimulatedSigner::new("n1");
        let sig = signer.sign(b"hello");
        assert!(SimulatedVerifier.verify(&signer.public_key_hex(), b"hello", &sig));
        assert!(!SimulatedVerifier.verify(&signer.public_key_hex(), b"other", &sig));
    }

    #[test]
    fn corrupt_key_file_is_an_error_not_a_silent_regeneration() {
        let dir = std::env::temp_dir().join(format!("pulsecore-test-{}", std::process::id() + 2));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("key.bin");
        std::fs::write(&path, b"not a valid 32 byte seed but more").unwrap();
        assert!(Ed25519Signer::load_or_create("n1", &path).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
