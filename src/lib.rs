//! afn-mesh: decentralized identity, pairing, and BLE mesh relay for
//! off-grid emergency messaging.
//!
//! When cellular and internet service are down, nearby devices form an
//! ad-hoc mesh over Bluetooth LE. Each device derives a checksummed,
//! human-shareable AFN-ID from its Ed25519 public key, establishes mutual
//! trust with other devices through a replay-resistant two-leg handshake,
//! and exchanges signed messages through a TTL-bounded store-and-forward
//! flood with persistent deduplication.
//!
//! The pieces compose explicitly; there are no process-wide singletons.
//! A typical composition root builds an [`identity::Identity`], a
//! [`contacts::ContactStore`], a [`pairing::PairingManager`], and a
//! [`mesh::RelayService`] over a [`mesh::RadioTransport`], then pumps
//! pairing envelopes through the relay as opaque message payloads.

pub mod contacts;
pub mod error;
pub mod group;
pub mod identity;
pub mod mesh;
pub mod pairing;
pub mod storage;

pub use contacts::{ContactStore, Person};
pub use error::AfnError;
pub use identity::Identity;
pub use mesh::{MeshMessage, MessageKind, RelayConfig, RelayHandle, RelayService};
pub use pairing::{PairingConfig, PairingEvent, PairingManager};
pub use storage::{KeyValueStore, MemoryStore};
