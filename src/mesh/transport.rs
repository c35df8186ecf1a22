//! Radio transport abstraction.
//!
//! The relay actor talks to hardware only through `RadioTransport`, so the
//! btleplug-backed link and the in-memory test double are interchangeable.
//! Peers are identified by an opaque string the transport chooses (a
//! peripheral id for BLE, a node name in memory).

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::AfnError;

/// Peripheral-role links are scarce; seven is a common platform ceiling.
pub const MAX_LINKS: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected { peer: String },
    PeerDisconnected { peer: String },
    Frame { peer: String, data: Vec<u8> },
}

#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Begin discovery and link maintenance.
    async fn start(&self) -> Result<()>;

    /// Tear down all links and stop discovery.
    async fn stop(&self) -> Result<()>;

    /// Take the event stream. Yields `None` after the first call; the relay
    /// actor is the only consumer.
    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Write one frame to a connected peer.
    async fn write(&self, peer: &str, frame: &[u8]) -> Result<()>;

    /// Peers with a live link right now.
    async fn connected_peers(&self) -> Vec<String>;

    /// Largest frame a single write can carry.
    fn mtu(&self) -> usize;
}

/// Wires `MemoryTransport` endpoints together for tests. Frames written to
/// a connected peer arrive on that peer's event stream; there is no radio,
/// no loss, and no reordering unless a link is cut.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: DashMap<String, mpsc::UnboundedSender<TransportEvent>>,
    links: DashMap<(String, String), ()>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an endpoint attached to this hub.
    pub fn endpoint(self: &Arc<Self>, name: &str) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(name.to_string(), tx);
        MemoryTransport {
            name: name.to_string(),
            hub: self.clone(),
            events: Mutex::new(Some(rx)),
        }
    }

    /// Connect two endpoints; both see a `PeerConnected`.
    pub fn link(&self, a: &str, b: &str) {
        self.links.insert(link_key(a, b), ());
        self.notify(a, TransportEvent::PeerConnected { peer: b.to_string() });
        self.notify(b, TransportEvent::PeerConnected { peer: a.to_string() });
    }

    /// Cut a link; both sides see a `PeerDisconnected` and writes start
    /// failing.
    pub fn unlink(&self, a: &str, b: &str) {
        if self.links.remove(&link_key(a, b)).is_some() {
            self.notify(a, TransportEvent::PeerDisconnected { peer: b.to_string() });
            self.notify(b, TransportEvent::PeerDisconnected { peer: a.to_string() });
        }
    }

    fn linked(&self, a: &str, b: &str) -> bool {
        self.links.contains_key(&link_key(a, b))
    }

    fn peers_of(&self, name: &str) -> Vec<String> {
        self.links
            .iter()
            .filter_map(|entry| {
                let (a, b) = entry.key();
                if a == name {
                    Some(b.clone())
                } else if b == name {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn notify(&self, name: &str, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(name) {
            let _ = tx.send(event);
        }
    }
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// In-memory `RadioTransport` for tests.
pub struct MemoryTransport {
    name: String,
    hub: Arc<MemoryHub>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MemoryTransport {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl RadioTransport for MemoryTransport {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for peer in self.hub.peers_of(&self.name) {
            self.hub.unlink(&self.name, &peer);
        }
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().await.take()
    }

    async fn write(&self, peer: &str, frame: &[u8]) -> Result<()> {
        if !self.hub.linked(&self.name, peer) {
            return Err(AfnError::PeerUnreachable(format!(
                "no link from {} to {peer}",
                self.name
            ))
            .into());
        }
        self.hub.notify(
            peer,
            TransportEvent::Frame {
                peer: self.name.clone(),
                data: frame.to_vec(),
            },
        );
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<String> {
        self.hub.peers_of(&self.name)
    }

    fn mtu(&self) -> usize {
        super::chunking::DEFAULT_MTU
    }
}
