//! AFN-ID codec.
//!
//! Derives a checksummed, human-shareable identifier from a public key.
//! The identifier is one-way: SHA-256 the key, keep a 5-byte payload prefix,
//! append the low 2 bytes of a CRC-32 over the payload, and Base32-encode the
//! 7 bytes (RFC 4648 alphabet, unpadded) into exactly 12 characters formatted
//! as `AFN-XXXX-XXXX-XXXX`. The original key cannot be recovered from it.

use crc::{Crc, CRC_32_ISO_HDLC};
use sha2::{Digest, Sha256};

/// RFC 4648 Base32 alphabet. No padding is ever emitted or accepted.
const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Hash-prefix length carried in an identity identifier.
pub const PAYLOAD_LEN: usize = 5;

/// Checksum length, shared with the group identifier codec.
pub const CHECKSUM_LEN: usize = 2;

/// Identifier body length in Base32 characters (7 raw bytes).
const ID_CHARS: usize = 12;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Outcome of identifier validation. Never an error: malformed input is
/// simply `ok == false` with no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,
    pub payload: Option<Vec<u8>>,
}

impl Validation {
    pub fn invalid() -> Self {
        Self { ok: false, payload: None }
    }

    fn valid(payload: Vec<u8>) -> Self {
        Self { ok: true, payload: Some(payload) }
    }
}

/// Derive the AFN-ID for a public key.
pub fn encode(pub_key: &[u8]) -> String {
    let digest = Sha256::digest(pub_key);
    let body = encode_body(&digest[..PAYLOAD_LEN]);
    format!("AFN-{}-{}-{}", &body[0..4], &body[4..8], &body[8..12])
}

/// Validate an AFN-ID and recover its payload bytes.
///
/// Strips the `AFN-` prefix and dashes, accepts lower-case input, requires
/// exactly 12 characters of the Base32 alphabet, and recomputes the checksum.
pub fn validate(id: &str) -> Validation {
    let Some(body) = normalize(id, "AFN") else {
        return Validation::invalid();
    };
    if body.len() != ID_CHARS {
        return Validation::invalid();
    }
    match decode_body(&body, PAYLOAD_LEN) {
        Some(payload) => Validation::valid(payload),
        None => Validation::invalid(),
    }
}

/// Mask the middle of an identifier for display, keeping the first and last
/// four characters visible: `AFN-ABCD-****-WXYZ`.
pub fn display_masked(id: &str) -> String {
    match normalize(id, "AFN") {
        Some(body) if body.len() == ID_CHARS => {
            format!("AFN-{}-****-{}", &body[0..4], &body[8..12])
        }
        _ => id.to_string(),
    }
}

/// Encode payload bytes plus their checksum as unpadded Base32.
/// Shared with the group identifier codec.
pub(crate) fn encode_body(payload: &[u8]) -> String {
    let mut raw = Vec::with_capacity(payload.len() + CHECKSUM_LEN);
    raw.extend_from_slice(payload);
    raw.extend_from_slice(&checksum(payload));
    base32_encode(&raw)
}

/// Decode a normalized Base32 body, verify the trailing checksum, and return
/// the payload. `None` on any malformed or corrupted input.
pub(crate) fn decode_body(body: &str, payload_len: usize) -> Option<Vec<u8>> {
    let raw = base32_decode(body, payload_len + CHECKSUM_LEN)?;
    let (payload, stored) = raw.split_at(payload_len);
    if stored != checksum(payload) {
        return None;
    }
    Some(payload.to_vec())
}

/// Strip dashes and an optional prefix, canonicalizing to upper case.
/// Returns `None` when any remaining character is outside the alphabet.
pub(crate) fn normalize(id: &str, prefix: &str) -> Option<String> {
    let compact: String = id
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let body = compact.strip_prefix(prefix).unwrap_or(&compact);
    if body.is_empty() || !body.bytes().all(|b| ALPHABET.contains(&b)) {
        return None;
    }
    Some(body.to_string())
}

/// Low 2 bytes of CRC-32 (ISO-HDLC) over the payload, big-endian.
pub(crate) fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let crc = CRC32.checksum(payload);
    [(crc >> 8) as u8, crc as u8]
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Strict unpadded decode: trailing bits beyond the final byte must be zero,
/// so a corrupted final character cannot slip through as padding.
fn base32_decode(text: &str, expected_len: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for ch in text.bytes() {
        let value = ALPHABET.iter().position(|&a| a == ch)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 && buffer != 0 {
        return None;
    }
    if out.len() != expected_len {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(tag: u8) -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = tag.wrapping_add(i as u8).wrapping_mul(31);
        }
        key
    }

    #[test]
    fn encode_is_deterministic_and_well_formed() {
        let id = encode(&sample_key(1));
        assert_eq!(id, encode(&sample_key(1)));
        assert_eq!(id.len(), "AFN-XXXX-XXXX-XXXX".len());
        assert!(id.starts_with("AFN-"));
        assert!(id
            .chars()
            .all(|c| c == '-' || ALPHABET.contains(&(c as u8))));
    }

    #[test]
    fn validate_accepts_own_encoding() {
        for tag in 0..16u8 {
            let key = sample_key(tag);
            let id = encode(&key);
            let validation = validate(&id);
            assert!(validation.ok, "rejected {id}");
            let digest = Sha256::digest(key);
            assert_eq!(validation.payload.unwrap(), digest[..PAYLOAD_LEN]);
        }
    }

    #[test]
    fn validate_is_case_and_dash_tolerant() {
        let id = encode(&sample_key(7));
        let lower = id.to_ascii_lowercase();
        assert!(validate(&lower).ok);
        let undashed: String = id.chars().filter(|c| *c != '-').collect();
        assert!(validate(&undashed).ok);
    }

    #[test]
    fn validate_rejects_malformed_input() {
        assert!(!validate("").ok);
        assert!(!validate("AFN-").ok);
        assert!(!validate("AFN-ABCD-EFGH").ok);
        assert!(!validate("AFN-ABC1-0000-0000").ok); // '1' and '0' not in alphabet
        assert!(!validate("not an id at all").ok);
        assert!(!validate("AFN-ABCD-EFGH-IJKL-MNOP").ok);
    }

    #[test]
    fn single_character_flips_are_caught() {
        let id = encode(&sample_key(3));
        let body: Vec<char> = id.chars().filter(|c| *c != '-').skip(3).collect();
        assert_eq!(body.len(), 12);
        for position in 0..body.len() {
            let mut flipped = body.clone();
            let original = flipped[position] as u8;
            let index = ALPHABET.iter().position(|&a| a == original).unwrap();
            flipped[position] = ALPHABET[(index + 1) % 32] as char;
            let candidate: String = flipped.iter().collect();
            assert!(
                !validate(&candidate).ok,
                "flip at {position} went undetected: {candidate}"
            );
        }
    }

    #[test]
    fn masked_display_hides_the_middle() {
        let id = encode(&sample_key(9));
        let masked = display_masked(&id);
        assert_eq!(&masked[0..8], &id[0..8]);
        assert!(masked.contains("****"));
        assert_eq!(&masked[masked.len() - 4..], &id[id.len() - 4..]);
    }

    #[test]
    fn masked_display_passes_through_garbage() {
        assert_eq!(display_masked("nonsense"), "nonsense");
    }
}
