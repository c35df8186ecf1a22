//! Authenticated group payload encryption.
//!
//! XChaCha20-Poly1305 under the derived group key with a fresh random
//! 24-byte nonce per message. `open` returns `None` on any authentication
//! failure; callers treat that as "drop silently" and never see partial
//! plaintext. Also derives the short verification phrase members compare
//! out-of-band to detect key substitution.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::codec::GROUP_KEY_LEN;

pub const NONCE_LEN: usize = 24;

/// Words in the verification phrase.
const PHRASE_WORDS: usize = 4;

/// 64-entry wordlist indexed by successive 6-bit windows of the key hash.
/// Shared by every device; changing it breaks phrase comparison.
const WORDLIST: [&str; 64] = [
    "acorn", "amber", "anchor", "aspen", "badge", "basil", "beacon", "birch",
    "bloom", "breeze", "brick", "cabin", "candle", "canyon", "cedar", "cliff",
    "cloud", "coral", "crane", "delta", "drift", "eagle", "ember", "falcon",
    "fern", "flint", "forge", "frost", "garnet", "glade", "grove", "harbor",
    "hazel", "ivory", "jade", "lantern", "lilac", "linen", "lunar", "maple",
    "meadow", "north", "ocean", "olive", "onyx", "opal", "orchid", "otter",
    "pearl", "pebble", "pine", "plume", "quartz", "raven", "reed", "ridge",
    "river", "slate", "spruce", "summit", "tidal", "torch", "willow", "wren",
];

/// A sealed payload: the nonce travels with the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Authenticated-encrypt a payload under the group key.
pub fn seal(key: &[u8; GROUP_KEY_LEN], plaintext: &[u8]) -> Sealed {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    // Encryption only fails on absurd plaintext lengths; treat as unreachable
    // by construction of BLE-sized payloads.
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .expect("XChaCha20-Poly1305 seal");
    Sealed { nonce, ciphertext }
}

/// Authenticated-decrypt. `None` on authentication failure, truncation, or a
/// wrong key; never partial data.
pub fn open(key: &[u8; GROUP_KEY_LEN], nonce: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return None;
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()
}

/// Deterministic human-pronounceable phrase for out-of-band key confirmation.
/// Both parties derive it from the key alone; a mismatch means someone
/// substituted the key in transit.
pub fn verification_phrase(key: &[u8; GROUP_KEY_LEN]) -> String {
    let digest = Sha256::digest(key);
    let mut words = Vec::with_capacity(PHRASE_WORDS);
    for i in 0..PHRASE_WORDS {
        let bit_offset = i * 6;
        let byte = bit_offset / 8;
        let shift = bit_offset % 8;
        let window = ((digest[byte] as u16) << 8) | digest[byte + 1] as u16;
        let index = ((window >> (10 - shift)) & 0x3f) as usize;
        words.push(WORDLIST[index]);
    }
    words.join(" ")
}
