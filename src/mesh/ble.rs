//! Bluetooth LE transport.
//!
//! Implements `RadioTransport` over btleplug: scans for peers advertising
//! the mesh service UUID (with a device-name prefix as a secondary filter),
//! connects as central, subscribes to the message characteristic, and
//! surfaces notifications as transport frames.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use uuid::Uuid;

use super::chunking::DEFAULT_MTU;
use super::transport::{RadioTransport, TransportEvent, MAX_LINKS};
use crate::error::AfnError;

/// GATT service advertised by every mesh node.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xafe7_4e01_9b3a_4d2c_8f5e_1a6b_7c8d_9e0f);

/// Characteristic carrying message frames in both directions.
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xafe7_4e02_9b3a_4d2c_8f5e_1a6b_7c8d_9e0f);

/// Secondary discovery filter on the advertised device name.
pub const DEVICE_NAME_PREFIX: &str = "AfetNet";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_RESTART_INTERVAL: Duration = Duration::from_secs(30);

struct Link {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

struct Inner {
    adapter: Mutex<Option<Adapter>>,
    links: RwLock<HashMap<String, Link>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    running: RwLock<bool>,
}

/// Bluetooth LE implementation of `RadioTransport`.
#[derive(Clone)]
pub struct BleTransport {
    inner: Arc<Inner>,
}

impl BleTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                adapter: Mutex::new(None),
                links: RwLock::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                running: RwLock::new(false),
            }),
        }
    }

    async fn spawn_event_loop(&self, adapter: &Adapter) -> Result<()> {
        let mut events = adapter.events().await.context("Failed to get adapter events")?;
        let transport = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if !*transport.inner.running.read().await {
                    break;
                }
                if let Err(e) = transport.handle_central_event(event).await {
                    warn!("Error handling BLE event: {e:#}");
                }
            }
            debug!("BLE central event stream ended");
        });
        Ok(())
    }

    /// Some platforms silently stop delivering scan results; restarting the
    /// scan periodically keeps discovery alive.
    fn spawn_scan_restart(&self) {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(SCAN_RESTART_INTERVAL);
            interval.tick().await;
            while *transport.inner.running.read().await {
                interval.tick().await;
                let adapter = transport.inner.adapter.lock().await;
                if let Some(adapter) = adapter.as_ref() {
                    let _ = adapter.stop_scan().await;
                    time::sleep(Duration::from_millis(100)).await;
                    let filter = ScanFilter { services: vec![SERVICE_UUID] };
                    if let Err(e) = adapter.start_scan(filter).await {
                        error!("Failed to restart BLE scan: {e}");
                    }
                }
            }
        });
    }

    async fn handle_central_event(&self, event: CentralEvent) -> Result<()> {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                self.attempt_connection(id).await?;
            }
            CentralEvent::DeviceDisconnected(id) => {
                let peer = peer_key(&id);
                if self.inner.links.write().await.remove(&peer).is_some() {
                    info!("Mesh peer disconnected: {peer}");
                    let _ = self
                        .inner
                        .events_tx
                        .send(TransportEvent::PeerDisconnected { peer });
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn attempt_connection(&self, id: PeripheralId) -> Result<()> {
        let peer = peer_key(&id);
        {
            let links = self.inner.links.read().await;
            if links.contains_key(&peer) {
                return Ok(());
            }
            if links.len() >= MAX_LINKS {
                debug!("Link budget exhausted, skipping {peer}");
                return Ok(());
            }
        }

        let adapter = self.inner.adapter.lock().await;
        let adapter = adapter.as_ref().context("Bluetooth adapter not initialized")?;
        let peripheral = adapter.peripheral(&id).await?;

        if let Ok(Some(properties)) = peripheral.properties().await {
            if let Some(name) = properties.local_name {
                if !name.starts_with(DEVICE_NAME_PREFIX) {
                    debug!("Ignoring non-mesh device {name:?}");
                    return Ok(());
                }
            }
        }

        debug!("Connecting to {peer}");
        match time::timeout(CONNECTION_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => self.setup_link(peripheral).await,
            Ok(Err(e)) => {
                warn!("Failed to connect to {peer}: {e}");
                Ok(())
            }
            Err(_) => {
                warn!("Connection timeout for {peer}");
                Ok(())
            }
        }
    }

    async fn setup_link(&self, peripheral: Peripheral) -> Result<()> {
        let peer = peer_key(&peripheral.id());

        peripheral
            .discover_services()
            .await
            .context("Failed to discover services")?;
        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == SERVICE_UUID)
            .context("Mesh service not found on peer")?;
        let characteristic = service
            .characteristics
            .iter()
            .find(|c| c.uuid == CHARACTERISTIC_UUID)
            .context("Mesh characteristic not found on peer")?
            .clone();

        peripheral
            .subscribe(&characteristic)
            .await
            .context("Failed to subscribe to mesh characteristic")?;

        self.inner.links.write().await.insert(
            peer.clone(),
            Link { peripheral: peripheral.clone(), characteristic },
        );

        // Forward notifications as frames until the stream ends.
        let events_tx = self.inner.events_tx.clone();
        let notify_peer = peer.clone();
        match peripheral.notifications().await {
            Ok(mut notifications) => {
                tokio::spawn(async move {
                    while let Some(notification) = notifications.next().await {
                        let _ = events_tx.send(TransportEvent::Frame {
                            peer: notify_peer.clone(),
                            data: notification.value,
                        });
                    }
                    debug!("Notification stream ended for {notify_peer}");
                });
            }
            Err(e) => {
                self.inner.links.write().await.remove(&peer);
                bail!("Failed to open notification stream for {peer}: {e}");
            }
        }

        info!("Mesh peer connected: {peer}");
        let _ = self
            .inner
            .events_tx
            .send(TransportEvent::PeerConnected { peer });
        Ok(())
    }
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioTransport for BleTransport {
    async fn start(&self) -> Result<()> {
        if *self.inner.running.read().await {
            return Ok(());
        }
        info!("Starting BLE mesh transport");

        let manager = Manager::new().await.context("Failed to create Bluetooth manager")?;
        let adapters = manager
            .adapters()
            .await
            .context("Failed to enumerate Bluetooth adapters")?;
        let adapter = adapters
            .into_iter()
            .next()
            .context("No Bluetooth adapters found")?;
        info!("Using Bluetooth adapter: {:?}", adapter.adapter_info().await?);

        adapter
            .start_scan(ScanFilter { services: vec![SERVICE_UUID] })
            .await
            .context("Failed to start BLE scan")?;

        *self.inner.adapter.lock().await = Some(adapter);
        *self.inner.running.write().await = true;

        {
            let adapter = self.inner.adapter.lock().await;
            if let Some(adapter) = adapter.as_ref() {
                self.spawn_event_loop(adapter).await?;
            }
        }
        self.spawn_scan_restart();

        info!("BLE mesh transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !*self.inner.running.read().await {
            return Ok(());
        }
        info!("Stopping BLE mesh transport");
        *self.inner.running.write().await = false;

        let links: Vec<(String, Peripheral)> = {
            let mut links = self.inner.links.write().await;
            links
                .drain()
                .map(|(peer, link)| (peer, link.peripheral))
                .collect()
        };
        for (peer, peripheral) in links {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {peer}: {e}");
            }
        }

        if let Some(adapter) = self.inner.adapter.lock().await.as_ref() {
            let _ = adapter.stop_scan().await;
        }
        info!("BLE mesh transport stopped");
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.events_rx.lock().await.take()
    }

    async fn write(&self, peer: &str, frame: &[u8]) -> Result<()> {
        let links = self.inner.links.read().await;
        let link = links
            .get(peer)
            .ok_or_else(|| AfnError::PeerUnreachable(format!("no link to peer {peer}")))?;
        link.peripheral
            .write(&link.characteristic, frame, WriteType::WithoutResponse)
            .await
            .map_err(|e| AfnError::Transport(format!("write to {peer} failed: {e}")))?;
        debug!("Wrote {} bytes to {peer}", frame.len());
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<String> {
        self.inner.links.read().await.keys().cloned().collect()
    }

    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }
}

fn peer_key(id: &PeripheralId) -> String {
    format!("{id:?}")
}
