//! Store-and-forward flood relay.
//!
//! A single actor task owns the outbound queue and the seen-set. Transport
//! events, API commands, and the periodic tick all serialize through its
//! select loop, so there is no duplicate-delivery race between a scan
//! callback and the relay timer. The actor never aborts on a per-message or
//! per-peer failure; a malformed frame or an unresponsive peer costs only
//! that frame or that peer.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use super::chunking::{chunk, Reassembler};
use super::transport::{RadioTransport, TransportEvent};
use super::wire::{MeshMessage, MessageKind, DEFAULT_TTL};
use crate::identity::Identity;
use crate::storage::KeyValueStore;

const SEEN_KEY: &str = "mesh:seen:v1";
const QUEUE_KEY: &str = "mesh:queue:v1";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hop budget stamped on locally originated messages.
    pub default_ttl: u8,
    /// How often the queue is drained to connected peers.
    pub tick_interval: Duration,
    /// Per-peer budget for writing one message's frames.
    pub write_timeout: Duration,
    /// First backoff step after a failed write; doubles per failure.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Seen-set bounds. Entries older than `seen_ttl` are evicted on the
    /// tick, and the set never exceeds `seen_cap` ids.
    pub seen_cap: usize,
    pub seen_ttl: Duration,
    pub queue_cap: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            tick_interval: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            seen_cap: 1000,
            seen_ttl: Duration::from_secs(24 * 60 * 60),
            queue_cap: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayStats {
    pub seen: usize,
    pub queued: usize,
    pub peers: Vec<String>,
}

/// A message awaiting flood to connected peers. `from_peer` is the link it
/// arrived on, excluded from forwarding to avoid an immediate echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedEntry {
    message: MeshMessage,
    from_peer: Option<String>,
}

enum Command {
    Originate {
        kind: MessageKind,
        lat: Option<f64>,
        lon: Option<f64>,
        payload: Option<Vec<u8>>,
        to_peer: Option<String>,
        reply: oneshot::Sender<String>,
    },
    Stats { reply: oneshot::Sender<RelayStats> },
    Stop { reply: oneshot::Sender<()> },
}

/// Cloneable handle to a running relay actor.
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RelayHandle {
    /// Broadcast an SOS with an optional position and freeform payload.
    pub async fn send_sos(
        &self,
        lat: Option<f64>,
        lon: Option<f64>,
        payload: Option<Vec<u8>>,
    ) -> Result<String> {
        self.originate(MessageKind::Sos, lat, lon, payload, None).await
    }

    /// Broadcast an opaque application payload.
    pub async fn send_message(&self, payload: Vec<u8>) -> Result<String> {
        self.originate(MessageKind::Msg, None, None, Some(payload), None)
            .await
    }

    /// Prefer a direct write to `peer` when connected; falls back to flood.
    pub async fn send_direct(&self, peer: &str, payload: Vec<u8>) -> Result<String> {
        self.originate(
            MessageKind::Msg,
            None,
            None,
            Some(payload),
            Some(peer.to_string()),
        )
        .await
    }

    pub async fn ping(&self) -> Result<String> {
        self.originate(MessageKind::Ping, None, None, None, None).await
    }

    async fn originate(
        &self,
        kind: MessageKind,
        lat: Option<f64>,
        lon: Option<f64>,
        payload: Option<Vec<u8>>,
        to_peer: Option<String>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Originate { kind, lat, lon, payload, to_peer, reply })
            .ok()
            .context("Relay actor is not running")?;
        rx.await.context("Relay actor dropped the request")
    }

    pub async fn stats(&self) -> Result<RelayStats> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .ok()
            .context("Relay actor is not running")?;
        rx.await.context("Relay actor dropped the request")
    }

    /// Stop the actor: flush persisted state, stop the transport, return
    /// once both are done.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .ok()
            .context("Relay actor is not running")?;
        rx.await.context("Relay actor dropped the request")
    }
}

#[derive(Default)]
struct PeerState {
    failures: u32,
    backoff_until: Option<Instant>,
}

pub struct RelayService {
    identity: Arc<Identity>,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn RadioTransport>,
    config: RelayConfig,
    seen: HashMap<String, i64>,
    queue: VecDeque<QueuedEntry>,
    peers: HashMap<String, PeerState>,
    reassembler: Reassembler,
    delivery: mpsc::UnboundedSender<MeshMessage>,
}

impl RelayService {
    /// Start the transport and spawn the relay actor. Returns a handle for
    /// commands and the channel on which received messages are delivered to
    /// the application, exactly once per message id.
    pub async fn start(
        identity: Arc<Identity>,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn RadioTransport>,
        config: RelayConfig,
    ) -> Result<(RelayHandle, mpsc::UnboundedReceiver<MeshMessage>)> {
        let events = transport
            .take_events()
            .await
            .context("Transport event stream already taken")?;
        transport.start().await.context("Failed to start transport")?;

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut service = Self {
            identity,
            store,
            transport,
            config,
            seen: HashMap::new(),
            queue: VecDeque::new(),
            peers: HashMap::new(),
            reassembler: Reassembler::new(),
            delivery: delivery_tx,
        };
        service.restore().await;

        tokio::spawn(async move {
            service.run(commands_rx, events).await;
        });

        Ok((RelayHandle { commands: commands_tx }, delivery_rx))
    }

    async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Relay actor started as {}", self.identity.afn_id());
        let mut tick = time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Originate { kind, lat, lon, payload, to_peer, reply }) => {
                            let id = self
                                .originate(kind, lat, lon, payload.as_deref(), to_peer)
                                .await;
                            let _ = reply.send(id);
                        }
                        Some(Command::Stats { reply }) => {
                            let _ = reply.send(RelayStats {
                                seen: self.seen.len(),
                                queued: self.queue.len(),
                                peers: self.peers.keys().cloned().collect(),
                            });
                        }
                        Some(Command::Stop { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            // All handles dropped; shut down cleanly.
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(event) = events.recv() => {
                    self.handle_event(event);
                }
                _ = tick.tick() => {
                    self.flush_queue().await;
                    self.evict();
                    self.reassembler.evict_stale();
                    self.persist().await;
                }
            }
        }
        info!("Relay actor stopped");
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer } => {
                debug!("Relay peer connected: {peer}");
                self.peers.entry(peer).or_default();
            }
            TransportEvent::PeerDisconnected { peer } => {
                debug!("Relay peer disconnected: {peer}");
                self.peers.remove(&peer);
            }
            TransportEvent::Frame { peer, data } => match self.reassembler.accept(&peer, &data) {
                Ok(Some(bytes)) => match MeshMessage::decode(&bytes) {
                    Ok(message) => self.handle_message(&peer, message),
                    Err(e) => debug!("Undecodable message from {peer} dropped: {e:#}"),
                },
                Ok(None) => {}
                Err(e) => debug!("Bad frame from {peer} dropped: {e:#}"),
            },
        }
    }

    fn handle_message(&mut self, peer: &str, message: MeshMessage) {
        if !message.verify() {
            warn!("Dropping unsigned or forged message {} from {peer}", message.id);
            return;
        }
        if self.seen.contains_key(&message.id) {
            debug!("Duplicate message {} dropped", message.id);
            return;
        }
        self.seen
            .insert(message.id.clone(), Utc::now().timestamp_millis());

        let ttl = message.ttl;
        let _ = self.delivery.send(message.clone());

        if ttl > 0 {
            let mut relayed = message;
            relayed.ttl = ttl - 1;
            self.enqueue(QueuedEntry {
                message: relayed,
                from_peer: Some(peer.to_string()),
            });
        }
    }

    async fn originate(
        &mut self,
        kind: MessageKind,
        lat: Option<f64>,
        lon: Option<f64>,
        payload: Option<&[u8]>,
        to_peer: Option<String>,
    ) -> String {
        let message = MeshMessage::originate(
            &self.identity,
            kind,
            self.config.default_ttl,
            lat,
            lon,
            payload,
        );
        let id = message.id.clone();
        // Our own id goes in the seen-set so the flood echo is not
        // re-delivered to us as a fresh message.
        self.seen.insert(id.clone(), message.ts);

        if let Some(peer) = to_peer {
            if self.peers.contains_key(&peer) && self.write_to_peer(&peer, &message).await {
                return id;
            }
            debug!("Direct write to {peer} unavailable, flooding instead");
        }
        self.enqueue(QueuedEntry { message, from_peer: None });
        id
    }

    fn enqueue(&mut self, entry: QueuedEntry) {
        if self.queue.len() >= self.config.queue_cap {
            if let Some(dropped) = self.queue.pop_front() {
                warn!("Relay queue full, dropping oldest message {}", dropped.message.id);
            }
        }
        self.queue.push_back(entry);
    }

    /// Push every queued message to all eligible peers. An entry leaves the
    /// queue once at least one peer took it; with no peers in reach it
    /// stays queued for the next tick.
    async fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let now = Instant::now();
        let eligible: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, state)| state.backoff_until.map_or(true, |until| now >= until))
            .map(|(peer, _)| peer.clone())
            .collect();
        if eligible.is_empty() {
            return;
        }

        let mut retained = VecDeque::new();
        while let Some(entry) = self.queue.pop_front() {
            let mut delivered = false;
            for peer in &eligible {
                if entry.from_peer.as_deref() == Some(peer.as_str()) {
                    continue;
                }
                if self.write_to_peer(peer, &entry.message).await {
                    delivered = true;
                }
            }
            if !delivered {
                retained.push_back(entry);
            }
        }
        self.queue = retained;
    }

    /// Chunk and write one message to one peer under the write timeout.
    /// Failure backs the peer off exponentially; success resets it.
    async fn write_to_peer(&mut self, peer: &str, message: &MeshMessage) -> bool {
        let frames = match message
            .encode()
            .and_then(|bytes| chunk(&message.id, &bytes, self.transport.mtu()))
        {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Failed to frame message {}: {e:#}", message.id);
                return false;
            }
        };

        let write_all = async {
            for frame in &frames {
                self.transport.write(peer, frame).await?;
            }
            Ok::<_, anyhow::Error>(())
        };
        let result = time::timeout(self.config.write_timeout, write_all).await;

        let state = self.peers.entry(peer.to_string()).or_default();
        match result {
            Ok(Ok(())) => {
                state.failures = 0;
                state.backoff_until = None;
                true
            }
            Ok(Err(e)) => {
                warn!("Write to {peer} failed: {e:#}");
                Self::back_off(state, &self.config);
                false
            }
            Err(_) => {
                warn!("Write to {peer} timed out");
                Self::back_off(state, &self.config);
                false
            }
        }
    }

    fn back_off(state: &mut PeerState, config: &RelayConfig) {
        state.failures = state.failures.saturating_add(1);
        let step = config
            .backoff_base
            .saturating_mul(1u32 << state.failures.min(16))
            .min(config.backoff_cap);
        state.backoff_until = Some(Instant::now() + step);
    }

    fn evict(&mut self) {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = self.config.seen_ttl.as_millis() as i64;
        self.seen.retain(|_, ts| now - *ts < ttl_ms);

        if self.seen.len() > self.config.seen_cap {
            let mut entries: Vec<(String, i64)> = self
                .seen
                .iter()
                .map(|(id, ts)| (id.clone(), *ts))
                .collect();
            entries.sort_by_key(|(_, ts)| *ts);
            let excess = entries.len() - self.config.seen_cap;
            for (id, _) in entries.into_iter().take(excess) {
                self.seen.remove(&id);
            }
        }
    }

    async fn restore(&mut self) {
        match self.store.get(SEEN_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<(String, i64)>>(&raw) {
                Ok(entries) => {
                    self.seen = entries.into_iter().collect();
                    debug!("Restored {} seen ids", self.seen.len());
                }
                Err(e) => warn!("Corrupt seen-set discarded: {e}"),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to load seen-set, starting empty: {e:#}"),
        }
        match self.store.get(QUEUE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<QueuedEntry>>(&raw) {
                Ok(entries) => {
                    debug!("Restored {} queued messages", entries.len());
                    self.queue = entries.into();
                }
                Err(e) => warn!("Corrupt queue discarded: {e}"),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to load queue, starting empty: {e:#}"),
        }
        self.evict();
    }

    /// Storage failures degrade to memory-only operation, never crash the
    /// actor.
    async fn persist(&self) {
        let seen: Vec<(&String, &i64)> = self.seen.iter().collect();
        match serde_json::to_string(&seen) {
            Ok(raw) => {
                if let Err(e) = self.store.set(SEEN_KEY, &raw).await {
                    warn!("Failed to persist seen-set: {e:#}");
                }
            }
            Err(e) => warn!("Failed to serialize seen-set: {e}"),
        }
        let queue: Vec<&QueuedEntry> = self.queue.iter().collect();
        match serde_json::to_string(&queue) {
            Ok(raw) => {
                if let Err(e) = self.store.set(QUEUE_KEY, &raw).await {
                    warn!("Failed to persist queue: {e:#}");
                }
            }
            Err(e) => warn!("Failed to serialize queue: {e}"),
        }
    }

    async fn shutdown(&mut self) {
        info!("Relay shutting down, flushing state");
        self.persist().await;
        if let Err(e) = self.transport.stop().await {
            warn!("Transport stop failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::transport::MemoryHub;
    use crate::storage::MemoryStore;

    fn test_config() -> RelayConfig {
        RelayConfig {
            tick_interval: Duration::from_millis(20),
            write_timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(10),
            ..RelayConfig::default()
        }
    }

    async fn node(
        hub: &Arc<MemoryHub>,
        name: &str,
        config: RelayConfig,
    ) -> (RelayHandle, mpsc::UnboundedReceiver<MeshMessage>, Arc<Identity>) {
        let identity = Arc::new(Identity::generate());
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let transport: Arc<dyn RadioTransport> = Arc::new(hub.endpoint(name));
        let (handle, delivery) =
            RelayService::start(identity.clone(), store, transport, config)
                .await
                .unwrap();
        (handle, delivery, identity)
    }

    #[tokio::test]
    async fn broadcast_reaches_connected_peer_once() {
        let hub = MemoryHub::new();
        let (alice, _alice_rx, alice_id) = node(&hub, "alice", test_config()).await;
        let (_bob, mut bob_rx, _) = node(&hub, "bob", test_config()).await;
        hub.link("alice", "bob");
        time::sleep(Duration::from_millis(50)).await;

        let id = alice.send_sos(Some(40.0), Some(29.0), None).await.unwrap();
        let received = time::timeout(Duration::from_secs(1), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, id);
        assert_eq!(received.from_pub, alice_id.public_key_b64());
        assert_eq!(received.kind, MessageKind::Sos);

        // The flood echo from bob must not surface again anywhere.
        time::sleep(Duration::from_millis(100)).await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn queued_message_delivered_after_late_link() {
        let hub = MemoryHub::new();
        let (alice, _alice_rx, _) = node(&hub, "alice", test_config()).await;
        let (_bob, mut bob_rx, _) = node(&hub, "bob", test_config()).await;

        // No link yet; the message waits in the queue.
        let id = alice.send_message(b"are you there".to_vec()).await.unwrap();
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(alice.stats().await.unwrap().queued, 1);

        hub.link("alice", "bob");
        let received = time::timeout(Duration::from_secs(1), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, id);
        assert_eq!(received.payload_bytes().unwrap(), b"are you there");
    }

    #[tokio::test]
    async fn duplicate_injection_delivers_once() {
        let hub = MemoryHub::new();
        let (_bob, mut bob_rx, _) = node(&hub, "bob", test_config()).await;
        let injector = hub.endpoint("injector");
        hub.link("injector", "bob");
        time::sleep(Duration::from_millis(30)).await;

        let sender = Identity::generate();
        let message =
            MeshMessage::originate(&sender, MessageKind::Msg, 2, None, None, Some(b"hi"));
        let bytes = message.encode().unwrap();
        for frame in chunk(&message.id, &bytes, injector.mtu()).unwrap() {
            injector.write("bob", &frame).await.unwrap();
            injector.write("bob", &frame).await.unwrap();
        }

        let received = time::timeout(Duration::from_secs(1), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, message.id);
        time::sleep(Duration::from_millis(100)).await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsigned_message_is_rejected() {
        let hub = MemoryHub::new();
        let (bob, mut bob_rx, _) = node(&hub, "bob", test_config()).await;
        let injector = hub.endpoint("injector");
        hub.link("injector", "bob");
        time::sleep(Duration::from_millis(30)).await;

        let sender = Identity::generate();
        let mut message =
            MeshMessage::originate(&sender, MessageKind::Sos, 3, None, None, None);
        message.signature = None;
        let bytes = message.encode().unwrap();
        for frame in chunk(&message.id, &bytes, injector.mtu()).unwrap() {
            injector.write("bob", &frame).await.unwrap();
        }

        time::sleep(Duration::from_millis(150)).await;
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(bob.stats().await.unwrap().seen, 0);
    }

    #[tokio::test]
    async fn seen_set_survives_restart() {
        let hub = MemoryHub::new();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let identity = Arc::new(Identity::generate());

        let transport: Arc<dyn RadioTransport> = Arc::new(hub.endpoint("node"));
        let (handle, _rx) = RelayService::start(
            identity.clone(),
            store.clone(),
            transport,
            test_config(),
        )
        .await
        .unwrap();
        handle.ping().await.unwrap();
        time::sleep(Duration::from_millis(60)).await;
        handle.stop().await.unwrap();

        let transport: Arc<dyn RadioTransport> = Arc::new(hub.endpoint("node"));
        let (handle, _rx) =
            RelayService::start(identity, store, transport, test_config())
                .await
                .unwrap();
        assert_eq!(handle.stats().await.unwrap().seen, 1);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_flushes_and_returns() {
        let hub = MemoryHub::new();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let transport: Arc<dyn RadioTransport> = Arc::new(hub.endpoint("node"));
        let (handle, _rx) = RelayService::start(
            Arc::new(Identity::generate()),
            store.clone(),
            transport,
            test_config(),
        )
        .await
        .unwrap();
        handle.send_message(b"pending".to_vec()).await.unwrap();
        handle.stop().await.unwrap();

        let raw = store.get(QUEUE_KEY).await.unwrap().unwrap();
        let queued: Vec<QueuedEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(queued.len(), 1);
        assert!(handle.ping().await.is_err());
    }
}
