//! Key material and signatures
//!
//! Every key is derived deterministically from a 32-byte seed:
//! - the user key (root) signs messages for the trust score and fee services
//! - address keys (by index) authorize spending from their address

pub mod keys;
pub mod signature;

pub use keys::{derive_address_key_pair, derive_user_key_pair, AddressHex, KeyPair, Seed};
pub use signature::{sha256, sign_digest, sign_message, verify_digest, Signature};
