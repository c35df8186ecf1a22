//! Local device identity.
//!
//! An Ed25519 keypair plus its derived AFN-ID. Created once on first run and
//! persisted through the key-value collaborator; immutable afterwards, since
//! regenerating it would invalidate every existing pairing.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::{info, warn};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::afn_id;
use crate::storage::KeyValueStore;

const IDENTITY_KEY: &str = "identity:v1";

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    secret: String,
    afn_id: String,
}

/// The device's long-lived signing identity.
pub struct Identity {
    signing_key: SigningKey,
    afn_id: String,
}

impl Identity {
    /// Load the persisted identity, or generate and persist a fresh one on
    /// first run. A persistence failure degrades to an ephemeral identity
    /// rather than refusing to start.
    pub async fn load_or_generate(store: &Arc<dyn KeyValueStore>) -> Result<Self> {
        match store.get(IDENTITY_KEY).await {
            Ok(Some(raw)) => {
                let stored: StoredIdentity =
                    serde_json::from_str(&raw).context("corrupt identity record")?;
                let secret = BASE64
                    .decode(&stored.secret)
                    .context("corrupt identity secret")?;
                let secret: [u8; 32] = secret
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("identity secret has wrong length"))?;
                let signing_key = SigningKey::from_bytes(&secret);
                let identity = Self::from_signing_key(signing_key);
                if identity.afn_id != stored.afn_id {
                    bail!("stored AFN-ID does not match stored key");
                }
                info!("Loaded identity {}", identity.afn_id);
                Ok(identity)
            }
            Ok(None) => {
                let identity = Self::generate();
                let record = StoredIdentity {
                    secret: BASE64.encode(identity.signing_key.to_bytes()),
                    afn_id: identity.afn_id.clone(),
                };
                if let Err(e) = store.set(IDENTITY_KEY, &serde_json::to_string(&record)?).await {
                    warn!("Failed to persist identity, continuing ephemeral: {e}");
                }
                info!("Generated new identity {}", identity.afn_id);
                Ok(identity)
            }
            Err(e) => {
                warn!("Identity storage unreadable, continuing ephemeral: {e}");
                Ok(Self::generate())
            }
        }
    }

    /// Generate a fresh identity without persisting it.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let afn_id = afn_id::encode(signing_key.verifying_key().as_bytes());
        Self { signing_key, afn_id }
    }

    pub fn afn_id(&self) -> &str {
        &self.afn_id
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key as base64, the form carried in `fromPub` on the wire.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature against a raw 32-byte public key.
/// Any malformed key, signature, or mismatch is simply `false`.
pub fn verify_signature(pub_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(pub_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn identity_survives_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let first = Identity::load_or_generate(&store).await.unwrap();
        let second = Identity::load_or_generate(&store).await.unwrap();
        assert_eq!(first.afn_id(), second.afn_id());
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[tokio::test]
    async fn afn_id_matches_public_key() {
        let identity = Identity::generate();
        let validation = afn_id::validate(identity.afn_id());
        assert!(validation.ok);
        assert_eq!(afn_id::encode(&identity.public_key_bytes()), identity.afn_id());
    }

    #[test]
    fn signatures_verify_and_reject_tampering() {
        let identity = Identity::generate();
        let signature = identity.sign(b"hello mesh");
        let pub_key = identity.public_key_bytes();

        assert!(verify_signature(&pub_key, b"hello mesh", &signature));
        assert!(!verify_signature(&pub_key, b"hello mess", &signature));

        let mut bent = signature;
        bent[5] ^= 0x01;
        assert!(!verify_signature(&pub_key, b"hello mesh", &bent));

        let other = Identity::generate();
        assert!(!verify_signature(&other.public_key_bytes(), b"hello mesh", &signature));
    }
}
