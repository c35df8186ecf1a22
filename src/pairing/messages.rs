//! Wire bodies of the two-message pairing handshake.
//!
//! Both travel as opaque payloads inside relay messages; the relay neither
//! inspects nor trusts them. JSON keeps them debuggable on the wire.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// First leg: "I claim to be `fromAfn`, here is my public key, pair with me."
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub id: Uuid,
    pub from_afn: String,
    pub to_afn: String,
    /// Base64 Ed25519 public key of the requester.
    pub from_pub: String,
    /// Unix millis at the requester.
    pub ts: i64,
}

/// Second leg: the target answers with its own key, referencing the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairAck {
    #[serde(rename = "ref")]
    pub ref_id: Uuid,
    pub to_afn: String,
    /// Base64 Ed25519 public key of the accepting device.
    pub to_pub: String,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PairingEnvelope {
    #[serde(rename = "PAIR_REQ")]
    Request(PairRequest),
    #[serde(rename = "PAIR_ACK")]
    Acknowledge(PairAck),
}

impl PairingEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize pairing envelope")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("parse pairing envelope")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_format_is_tagged() {
        let req = PairingEnvelope::Request(PairRequest {
            id: Uuid::new_v4(),
            from_afn: "AFN-AAAA-BBBB-CCCC".into(),
            to_afn: "AFN-DDDD-EEEE-FFFF".into(),
            from_pub: "cHVi".into(),
            ts: 1_700_000_000_000,
        });
        let bytes = req.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"kind\":\"PAIR_REQ\""));
        assert!(text.contains("\"fromAfn\""));

        match PairingEnvelope::from_bytes(&bytes).unwrap() {
            PairingEnvelope::Request(parsed) => {
                assert_eq!(parsed.from_afn, "AFN-AAAA-BBBB-CCCC");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ack_uses_ref_field_on_the_wire() {
        let ack = PairingEnvelope::Acknowledge(PairAck {
            ref_id: Uuid::new_v4(),
            to_afn: "AFN-DDDD-EEEE-FFFF".into(),
            to_pub: "cHVi".into(),
            ts: 0,
        });
        let text = String::from_utf8(ack.to_bytes().unwrap()).unwrap();
        assert!(text.contains("\"ref\""));
        assert!(!text.contains("ref_id"));
    }
}
