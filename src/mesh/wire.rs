//! Mesh wire format.
//!
//! Messages travel as JSON over a GATT characteristic, chunked to the link
//! MTU by `chunking`. Binary fields (`fromPub`, `payload`, `signature`) are
//! base64 strings on the wire.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{verify_signature, Identity};

/// Hop budget stamped on locally originated messages.
pub const DEFAULT_TTL: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "SOS")]
    Sos,
    #[serde(rename = "MSG")]
    Msg,
    #[serde(rename = "PING")]
    Ping,
}

/// A single mesh message as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshMessage {
    pub id: String,
    pub from_pub: String,
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub ttl: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl MeshMessage {
    /// Build a signed message originating at this identity. Stamps a fresh
    /// id and the current time.
    pub fn originate(
        identity: &Identity,
        kind: MessageKind,
        ttl: u8,
        lat: Option<f64>,
        lon: Option<f64>,
        payload: Option<&[u8]>,
    ) -> Self {
        let mut message = Self {
            id: Uuid::new_v4().to_string(),
            from_pub: identity.public_key_b64(),
            ts: Utc::now().timestamp_millis(),
            kind,
            ttl,
            lat,
            lon,
            payload: payload.map(|p| BASE64.encode(p)),
            signature: None,
        };
        let signature = identity.sign(&message.signing_bytes());
        message.signature = Some(BASE64.encode(signature));
        message
    }

    /// Canonical bytes covered by the signature. The ttl is excluded so
    /// relays can decrement it without invalidating the sender's signature;
    /// the signature field itself is excluded by construction.
    fn signing_bytes(&self) -> Vec<u8> {
        let ts = self.ts.to_string();
        let lat = self.lat.map(|v| v.to_bits().to_string()).unwrap_or_default();
        let lon = self.lon.map(|v| v.to_bits().to_string()).unwrap_or_default();
        let mut bytes = Vec::new();
        for field in [
            self.id.as_str(),
            self.from_pub.as_str(),
            ts.as_str(),
            kind_tag(self.kind),
            lat.as_str(),
            lon.as_str(),
            self.payload.as_deref().unwrap_or(""),
        ] {
            bytes.extend_from_slice(field.as_bytes());
            bytes.push(b'\n');
        }
        bytes
    }

    /// Check the Ed25519 signature against `fromPub`. Unsigned messages and
    /// messages whose key or signature fail to decode are all `false`.
    pub fn verify(&self) -> bool {
        let Some(signature_b64) = &self.signature else {
            return false;
        };
        let (Ok(pub_key), Ok(signature)) =
            (BASE64.decode(&self.from_pub), BASE64.decode(signature_b64))
        else {
            return false;
        };
        verify_signature(&pub_key, &self.signing_bytes(), &signature)
    }

    pub fn payload_bytes(&self) -> Option<Vec<u8>> {
        self.payload
            .as_deref()
            .and_then(|p| BASE64.decode(p).ok())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode mesh message")
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Failed to decode mesh message")
    }
}

fn kind_tag(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Sos => "SOS",
        MessageKind::Msg => "MSG",
        MessageKind::Ping => "PING",
    }
}
