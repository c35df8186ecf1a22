//! AFN-GID codec and group key derivation.
//!
//! A group is anchored by a random 16-byte seed. The shareable identifier is
//! built from a 3-byte seed prefix plus the same 2-byte checksum the identity
//! codec uses, Base32-encoded into 8 characters: `AFN-GID-XXXX-XXXX`. The
//! 32-byte symmetric key is derived from the seed and the *sorted* member
//! public keys, so every member reaches a byte-identical key no matter the
//! order they collected the keys in.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::identity::afn_id::{self, Validation};

/// Random seed held only by the group's creator.
pub const SEED_LEN: usize = 16;

/// Seed-prefix length carried in a group identifier.
pub const GID_PAYLOAD_LEN: usize = 3;

/// Group identifier body length in Base32 characters (5 raw bytes).
const GID_CHARS: usize = 8;

/// Length of the derived symmetric group key.
pub const GROUP_KEY_LEN: usize = 32;

const KEY_INFO: &[u8] = b"afn-mesh group key v1";

/// Generate a fresh group seed from the OS CSPRNG.
pub fn generate_seed() -> [u8; SEED_LEN] {
    let mut seed = [0u8; SEED_LEN];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// Derive the shareable group identifier from a seed.
pub fn gid_from_seed(seed: &[u8; SEED_LEN]) -> String {
    let body = afn_id::encode_body(&seed[..GID_PAYLOAD_LEN]);
    format!("AFN-GID-{}-{}", &body[0..4], &body[4..8])
}

/// Validate an AFN-GID. Mirrors the identity codec's contract: never an
/// error, malformed input is `ok == false`.
pub fn validate_gid(gid: &str) -> Validation {
    let Some(body) = afn_id::normalize(gid, "AFNGID") else {
        return Validation::invalid();
    };
    if body.len() != GID_CHARS {
        return Validation::invalid();
    }
    match afn_id::decode_body(&body, GID_PAYLOAD_LEN) {
        Some(payload) => Validation { ok: true, payload: Some(payload) },
        None => Validation::invalid(),
    }
}

/// Derive the 32-byte symmetric group key from the seed and member keys.
///
/// Member keys are sorted lexicographically before being fed to HKDF-SHA256;
/// sorting is what makes the derivation order-independent, so it is not
/// optional. The seed acts as the HKDF salt.
pub fn derive_group_key(seed: &[u8; SEED_LEN], member_pub_keys: &[Vec<u8>]) -> [u8; GROUP_KEY_LEN] {
    let mut sorted: Vec<&Vec<u8>> = member_pub_keys.iter().collect();
    sorted.sort();

    let mut ikm = Vec::with_capacity(sorted.iter().map(|k| k.len()).sum());
    for key in sorted {
        ikm.extend_from_slice(key);
    }

    let hk = Hkdf::<Sha256>::new(Some(seed.as_slice()), &ikm);
    let mut okm = [0u8; GROUP_KEY_LEN];
    // Expanding to 32 bytes cannot exceed the HKDF output bound.
    hk.expand(KEY_INFO, &mut okm)
        .expect("32-byte HKDF expand is always valid");
    okm
}
