//! Error taxonomy for the mesh subsystem.
//!
//! Validation and authentication failures are values, not errors: malformed
//! identifiers yield `Validation::invalid()` and failed decrypts yield `None`.
//! The variants here cover the failures that cross a service seam.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AfnError {
    /// A radio-level connect or write failed. Retried with backoff at the
    /// connection layer; surfaces to the relay loop as "peer unreachable"
    /// without aborting delivery to other peers.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer exists but did not accept a write within the timeout.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Key-value storage I/O failed. In-memory state keeps operating in a
    /// degraded mode; callers log and continue.
    #[error("persistence failure: {0}")]
    Persistence(String),
}
