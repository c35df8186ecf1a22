//! Contact pairing over the mesh: a two-leg request/acknowledge handshake
//! that binds public keys to AFN-IDs with user confirmation on both ends.

pub mod handshake;
pub mod messages;

pub use handshake::{
    Handshake, HandshakeStatus, PairingConfig, PairingEvent, PairingManager,
};
pub use messages::{PairAck, PairRequest, PairingEnvelope};
