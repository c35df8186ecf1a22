//! TTL-bounded store-and-forward flood relay over Bluetooth LE.
//!
//! `wire` defines the signed message format, `chunking` splits it across
//! MTU-sized frames, `transport` abstracts the radio (with a btleplug
//! implementation in `ble` behind the `ble` feature), and `relay` runs the
//! actor that owns the queue and seen-set.

#[cfg(feature = "ble")]
pub mod ble;
pub mod chunking;
pub mod relay;
pub mod transport;
pub mod wire;

#[cfg(feature = "ble")]
pub use ble::BleTransport;
pub use relay::{RelayConfig, RelayHandle, RelayService, RelayStats};
pub use transport::{MemoryHub, MemoryTransport, RadioTransport, TransportEvent, MAX_LINKS};
pub use wire::{MeshMessage, MessageKind, DEFAULT_TTL};
