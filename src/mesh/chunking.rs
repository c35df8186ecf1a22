//! MTU chunking and reassembly.
//!
//! A serialized mesh message rarely fits in one BLE write, so it is split
//! into frames with a 9-byte header:
//!
//! ```text
//! magic(2) version(1) tag(4, big-endian) index(1) total(1)
//! ```
//!
//! The tag is the CRC-32 of the message id, so frames of the same message
//! share a tag without the header having to carry the full id. Reassembly is
//! bucketed per (peer, tag); partial buckets are evicted after a timeout so
//! a peer that stops mid-message cannot pin memory forever.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::afn_id::CRC32;

pub const FRAME_MAGIC: [u8; 2] = [0xAF, 0x4E];
pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 9;

/// Assumed writable payload per GATT write on a modern link.
pub const DEFAULT_MTU: usize = 244;

const PARTIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Split an encoded message into MTU-sized frames.
pub fn chunk(message_id: &str, data: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>> {
    if mtu <= HEADER_LEN {
        bail!("MTU {mtu} leaves no room for a frame body");
    }
    let body_len = mtu - HEADER_LEN;
    let total = data.len().div_ceil(body_len).max(1);
    if total > u8::MAX as usize {
        bail!("Message of {} bytes exceeds {} frames", data.len(), u8::MAX);
    }

    let tag = CRC32.checksum(message_id.as_bytes());
    let mut frames = Vec::with_capacity(total);
    for (index, body) in data.chunks(body_len).enumerate() {
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.extend_from_slice(&tag.to_be_bytes());
        frame.push(index as u8);
        frame.push(total as u8);
        frame.extend_from_slice(body);
        frames.push(frame);
    }
    if frames.is_empty() {
        // Zero-length message still needs one frame to carry the header.
        let mut frame = Vec::with_capacity(HEADER_LEN);
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.extend_from_slice(&tag.to_be_bytes());
        frame.push(0);
        frame.push(1);
        frames.push(frame);
    }
    Ok(frames)
}

struct Partial {
    total: u8,
    bodies: HashMap<u8, Vec<u8>>,
    started: Instant,
}

/// Rebuilds messages from interleaved frames, one bucket per (peer, tag).
#[derive(Default)]
pub struct Reassembler {
    partials: HashMap<(String, u32), Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns the full message once the last missing frame
    /// arrives, `None` while incomplete, and `Err` on malformed frames.
    pub fn accept(&mut self, peer: &str, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        if frame.len() < HEADER_LEN {
            bail!("Frame of {} bytes is shorter than the header", frame.len());
        }
        if frame[0..2] != FRAME_MAGIC {
            bail!("Bad frame magic");
        }
        if frame[2] != FRAME_VERSION {
            bail!("Unsupported frame version {}", frame[2]);
        }
        let tag = u32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]);
        let index = frame[7];
        let total = frame[8];
        if total == 0 || index >= total {
            bail!("Frame index {index} out of range for total {total}");
        }

        let key = (peer.to_string(), tag);
        let partial = self.partials.entry(key.clone()).or_insert_with(|| Partial {
            total,
            bodies: HashMap::new(),
            started: Instant::now(),
        });
        if partial.total != total {
            // Tag collision or a restarted transfer; start over with the new
            // framing rather than mixing bodies.
            *partial = Partial {
                total,
                bodies: HashMap::new(),
                started: Instant::now(),
            };
        }
        partial.bodies.insert(index, frame[HEADER_LEN..].to_vec());

        if partial.bodies.len() == total as usize {
            let mut message = Vec::new();
            for index in 0..total {
                if let Some(body) = partial.bodies.get(&index) {
                    message.extend_from_slice(body);
                }
            }
            self.partials.remove(&key);
            return Ok(Some(message));
        }
        Ok(None)
    }

    /// Drop partial buckets older than the timeout. Called from the relay
    /// tick.
    pub fn evict_stale(&mut self) {
        self.partials
            .retain(|_, partial| partial.started.elapsed() < PARTIAL_TIMEOUT);
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_round_trip() {
        let data = b"short message".to_vec();
        let frames = chunk("msg-1", &data, DEFAULT_MTU).unwrap();
        assert_eq!(frames.len(), 1);

        let mut reassembler = Reassembler::new();
        let out = reassembler.accept("peer-a", &frames[0]).unwrap();
        assert_eq!(out, Some(data));
    }

    #[test]
    fn multi_frame_out_of_order() {
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let mut frames = chunk("msg-2", &data, DEFAULT_MTU).unwrap();
        assert!(frames.len() > 1);
        frames.reverse();

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for frame in &frames {
            if let Some(message) = reassembler.accept("peer-a", frame).unwrap() {
                result = Some(message);
            }
        }
        assert_eq!(result, Some(data));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn frames_respect_the_mtu() {
        let data = vec![7u8; 5000];
        let frames = chunk("msg-3", &data, DEFAULT_MTU).unwrap();
        assert!(frames.iter().all(|f| f.len() <= DEFAULT_MTU));
        let body_total: usize = frames.iter().map(|f| f.len() - HEADER_LEN).sum();
        assert_eq!(body_total, data.len());
    }

    #[test]
    fn interleaved_peers_do_not_mix() {
        let a: Vec<u8> = vec![1; 600];
        let b: Vec<u8> = vec![2; 600];
        let frames_a = chunk("msg-a", &a, DEFAULT_MTU).unwrap();
        let frames_b = chunk("msg-b", &b, DEFAULT_MTU).unwrap();

        let mut reassembler = Reassembler::new();
        let mut done = Vec::new();
        for (fa, fb) in frames_a.iter().zip(frames_b.iter()) {
            if let Some(m) = reassembler.accept("peer-a", fa).unwrap() {
                done.push(m);
            }
            if let Some(m) = reassembler.accept("peer-b", fb).unwrap() {
                done.push(m);
            }
        }
        assert_eq!(done, vec![a, b]);
    }

    #[test]
    fn duplicate_frames_are_idempotent() {
        let data = vec![9u8; 700];
        let frames = chunk("msg-d", &data, DEFAULT_MTU).unwrap();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.accept("peer-a", &frames[0]).unwrap().is_none());
        assert!(reassembler.accept("peer-a", &frames[0]).unwrap().is_none());
        let mut out = None;
        for frame in &frames[1..] {
            if let Some(m) = reassembler.accept("peer-a", frame).unwrap() {
                out = Some(m);
            }
        }
        assert_eq!(out, Some(data));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.accept("peer-a", b"tiny").is_err());
        let mut bad_magic = chunk("m", b"x", DEFAULT_MTU).unwrap().remove(0);
        bad_magic[0] = 0x00;
        assert!(reassembler.accept("peer-a", &bad_magic).is_err());
    }

    #[test]
    fn mtu_too_small_for_header() {
        assert!(chunk("m", b"data", HEADER_LEN).is_err());
    }
}
