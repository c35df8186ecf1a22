//! Groups: shareable AFN-GID identifiers, symmetric key derivation, and
//! authenticated payload encryption for member-to-member traffic.

pub mod cipher;
pub mod codec;
pub mod manager;

pub use cipher::{open, seal, verification_phrase, Sealed};
pub use codec::{derive_group_key, generate_seed, gid_from_seed, validate_gid};
pub use manager::{Group, GroupManager, GroupMember};
