//! Remote services: full node and trust score node

pub mod client;
pub mod memory;
pub mod trust_score;
pub mod types;

pub use client::{HttpLedgerClient, LedgerClient};
pub use memory::{MemoryLedger, MemoryTrustScore};
pub use trust_score::{HttpTrustScoreGateway, TrustScoreGateway};
pub use types::{FullNodeFeeRequest, NetworkFeeRequest, TokenDetails};
