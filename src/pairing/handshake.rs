//! The pairing handshake state machine.
//!
//! Binds a newly learned public key to a claimed AFN-ID over an unreliable
//! broadcast medium. Every validation failure drops the inbound message
//! silently (no error is echoed to the remote peer, so the protocol leaks no
//! validation oracle); local callers get a boolean, never an error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::{PairAck, PairRequest, PairingEnvelope};
use crate::contacts::ContactStore;
use crate::identity::{afn_id, Identity};

#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Accepted |now - ts| skew for both handshake legs. Rejects stale
    /// replays and clock-skewed-future timestamps alike.
    pub clock_window: Duration,
    /// Age after which non-terminal handshakes are purged.
    pub stale_after: Duration,
    /// Bound on the request replay cache.
    pub replay_cap: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            clock_window: Duration::from_secs(10 * 60),
            stale_after: Duration::from_secs(60 * 60),
            replay_cap: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    PendingOutbound,
    PendingInbound,
    Accepted,
    Completed,
    Rejected,
}

impl HandshakeStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub request_id: Uuid,
    pub from_afn: String,
    pub to_afn: String,
    pub from_pub: String,
    pub timestamp: i64,
    pub status: HandshakeStatus,
}

/// Surfaced to the host's user-confirmation collaborator.
#[derive(Debug, Clone)]
pub enum PairingEvent {
    /// An inbound request passed validation; ask the user to accept/reject.
    RequestReceived { request_id: Uuid, from_afn: String },
    /// A handshake we initiated completed; the contact is now paired.
    Completed { afn_id: String },
}

/// Owns all in-flight handshakes and the request replay cache.
///
/// Constructed explicitly by the composition root and wired to the relay via
/// the injected outbound channel; there is no process-wide instance.
pub struct PairingManager {
    identity: Arc<Identity>,
    contacts: Arc<ContactStore>,
    config: PairingConfig,
    handshakes: DashMap<Uuid, Handshake>,
    seen_requests: DashMap<Uuid, i64>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::UnboundedSender<PairingEvent>,
}

impl PairingManager {
    /// `outbound` carries serialized envelopes to the relay. The returned
    /// receiver surfaces `PairingEvent`s to the UI collaborator.
    pub fn new(
        identity: Arc<Identity>,
        contacts: Arc<ContactStore>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        config: PairingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PairingEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            identity,
            contacts,
            config,
            handshakes: DashMap::new(),
            seen_requests: DashMap::new(),
            outbound,
            events,
        };
        (manager, events_rx)
    }

    /// Start a handshake toward a manually entered or scanned AFN-ID.
    /// Returns the request id, or `None` when the target fails checksum
    /// validation or is our own identity.
    pub fn initiate(&self, target_afn: &str) -> Option<Uuid> {
        if !afn_id::validate(target_afn).ok {
            debug!("Refusing to initiate pairing with invalid id {target_afn}");
            return None;
        }
        if same_afn(target_afn, self.identity.afn_id()) {
            debug!("Refusing to pair with self");
            return None;
        }

        let request = PairRequest {
            id: Uuid::new_v4(),
            from_afn: self.identity.afn_id().to_string(),
            to_afn: target_afn.to_string(),
            from_pub: self.identity.public_key_b64(),
            ts: Utc::now().timestamp_millis(),
        };
        let handshake = Handshake {
            request_id: request.id,
            from_afn: request.from_afn.clone(),
            to_afn: request.to_afn.clone(),
            from_pub: request.from_pub.clone(),
            timestamp: request.ts,
            status: HandshakeStatus::PendingOutbound,
        };

        let Ok(body) = PairingEnvelope::Request(request.clone()).to_bytes() else {
            return None;
        };
        self.handshakes.insert(request.id, handshake);
        if self.outbound.send(body).is_err() {
            warn!("Relay channel closed, dropping pairing request");
            self.handshakes.remove(&request.id);
            return None;
        }
        info!("Pairing initiated with {}", afn_id::display_masked(target_afn));
        Some(request.id)
    }

    /// Feed an inbound pairing payload from the relay. `false` means the
    /// message was dropped; the remote learns nothing about why.
    pub async fn handle_inbound(&self, body: &[u8]) -> bool {
        match PairingEnvelope::from_bytes(body) {
            Ok(PairingEnvelope::Request(request)) => self.handle_request(request).await,
            Ok(PairingEnvelope::Acknowledge(ack)) => self.handle_ack(ack).await,
            Err(e) => {
                debug!("Unparseable pairing payload dropped: {e}");
                false
            }
        }
    }

    async fn handle_request(&self, request: PairRequest) -> bool {
        if self.seen_requests.contains_key(&request.id) {
            debug!("Replayed pairing request {} dropped", request.id);
            return false;
        }
        if !self.within_window(request.ts) {
            debug!("Pairing request {} outside clock window", request.id);
            return false;
        }
        if !same_afn(&request.to_afn, self.identity.afn_id()) {
            debug!("Pairing request {} not addressed to us", request.id);
            return false;
        }
        if !afn_id::validate(&request.from_afn).ok || !afn_id::validate(&request.to_afn).ok {
            debug!("Pairing request {} has malformed identifiers", request.id);
            return false;
        }
        if !key_matches_id(&request.from_pub, &request.from_afn) {
            warn!(
                "Pairing request {} claims {} but key hashes elsewhere",
                request.id,
                afn_id::display_masked(&request.from_afn)
            );
            return false;
        }

        self.seen_requests
            .insert(request.id, Utc::now().timestamp_millis());
        self.handshakes.insert(
            request.id,
            Handshake {
                request_id: request.id,
                from_afn: request.from_afn.clone(),
                to_afn: request.to_afn.clone(),
                from_pub: request.from_pub.clone(),
                timestamp: request.ts,
                status: HandshakeStatus::PendingInbound,
            },
        );
        let _ = self.events.send(PairingEvent::RequestReceived {
            request_id: request.id,
            from_afn: request.from_afn,
        });
        true
    }

    /// User accepted an inbound request: answer with our key and record the
    /// requester as a paired contact (their key was verified on receipt).
    pub async fn accept(&self, request_id: Uuid) -> bool {
        let (from_afn, from_pub) = {
            let Some(mut handshake) = self.handshakes.get_mut(&request_id) else {
                return false;
            };
            if handshake.status != HandshakeStatus::PendingInbound {
                return false;
            }
            handshake.status = HandshakeStatus::Accepted;
            (handshake.from_afn.clone(), handshake.from_pub.clone())
        };

        let ack = PairAck {
            ref_id: request_id,
            to_afn: self.identity.afn_id().to_string(),
            to_pub: self.identity.public_key_b64(),
            ts: Utc::now().timestamp_millis(),
        };
        let Ok(body) = PairingEnvelope::Acknowledge(ack).to_bytes() else {
            return false;
        };
        if self.outbound.send(body).is_err() {
            warn!("Relay channel closed, dropping pairing ack");
            return false;
        }

        if let Err(e) = self.contacts.mark_paired(&from_afn, &from_pub).await {
            warn!("Failed to record paired contact {from_afn}: {e}");
        }
        if let Some(mut handshake) = self.handshakes.get_mut(&request_id) {
            handshake.status = HandshakeStatus::Completed;
        }
        info!("Accepted pairing with {}", afn_id::display_masked(&from_afn));
        true
    }

    /// User declined an inbound request. Nothing is sent back.
    pub fn reject(&self, request_id: Uuid) -> bool {
        match self.handshakes.get_mut(&request_id) {
            Some(mut handshake) if handshake.status == HandshakeStatus::PendingInbound => {
                handshake.status = HandshakeStatus::Rejected;
                true
            }
            _ => false,
        }
    }

    async fn handle_ack(&self, ack: PairAck) -> bool {
        let target_afn = {
            let Some(handshake) = self.handshakes.get(&ack.ref_id) else {
                debug!("Pairing ack {} matches no handshake", ack.ref_id);
                return false;
            };
            if handshake.status != HandshakeStatus::PendingOutbound {
                debug!("Pairing ack {} for non-pending handshake", ack.ref_id);
                return false;
            }
            handshake.to_afn.clone()
        };
        if !self.within_window(ack.ts) {
            debug!("Pairing ack {} outside clock window", ack.ref_id);
            return false;
        }
        // The binding check: the key in the ack must hash to the identity we
        // originally addressed, or someone substituted a key mid-flight.
        if !key_matches_id(&ack.to_pub, &target_afn) {
            warn!(
                "Pairing ack {} key does not match {}",
                ack.ref_id,
                afn_id::display_masked(&target_afn)
            );
            return false;
        }

        if let Err(e) = self.contacts.mark_paired(&target_afn, &ack.to_pub).await {
            warn!("Failed to record paired contact {target_afn}: {e}");
        }
        if let Some(mut handshake) = self.handshakes.get_mut(&ack.ref_id) {
            handshake.status = HandshakeStatus::Completed;
        }
        let _ = self
            .events
            .send(PairingEvent::Completed { afn_id: target_afn.clone() });
        info!("Pairing completed with {}", afn_id::display_masked(&target_afn));
        true
    }

    pub fn status(&self, request_id: Uuid) -> Option<HandshakeStatus> {
        self.handshakes.get(&request_id).map(|h| h.status)
    }

    /// Garbage-collect terminal and expired handshakes, and bound the replay
    /// cache. Called periodically by the composition root.
    pub fn purge_stale(&self) {
        let now = Utc::now().timestamp_millis();
        let stale_ms = self.config.stale_after.as_millis() as i64;
        self.handshakes
            .retain(|_, h| !h.status.is_terminal() && now - h.timestamp < stale_ms);

        let replay_ms = 2 * self.config.clock_window.as_millis() as i64;
        self.seen_requests.retain(|_, seen| now - *seen < replay_ms);
        if self.seen_requests.len() > self.config.replay_cap {
            let mut entries: Vec<(Uuid, i64)> = self
                .seen_requests
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect();
            entries.sort_by_key(|(_, seen)| *seen);
            let excess = entries.len() - self.config.replay_cap;
            for (id, _) in entries.into_iter().take(excess) {
                self.seen_requests.remove(&id);
            }
        }
    }

    fn within_window(&self, ts: i64) -> bool {
        let now = Utc::now().timestamp_millis();
        (now - ts).unsigned_abs() <= self.config.clock_window.as_millis() as u64
    }
}

/// Compare two identifiers ignoring case, dashes, and prefix.
fn same_afn(a: &str, b: &str) -> bool {
    match (afn_id::normalize(a, "AFN"), afn_id::normalize(b, "AFN")) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Does this base64 public key hash to the claimed AFN-ID?
fn key_matches_id(pub_key_b64: &str, claimed_afn: &str) -> bool {
    let Ok(key) = BASE64.decode(pub_key_b64) else {
        return false;
    };
    same_afn(&afn_id::encode(&key), claimed_afn)
}
