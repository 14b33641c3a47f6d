//! Coti Wallet Engine Library
//!
//! Client-side wallet for the Coti DAG ledger: seed-derived keys, balance
//! and history sync against a full node, a live event stream, trust score
//! management and transaction signing.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod node;
pub mod stream;
pub mod transaction;
pub mod wallet;

// Re-export commonly used types
pub use config::{Config, Network};
pub use error::{Error, Result};
pub use wallet::Wallet;
