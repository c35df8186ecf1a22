//! Device identity: the AFN-ID codec and the long-lived signing keypair.

pub mod afn_id;
pub mod keypair;

pub use afn_id::{display_masked, encode, validate, Validation};
pub use keypair::{verify_signature, Identity};
