//! Wallet state: tracked addresses, known transactions and change events
//!
//! ```text
//!                 Wallet
//!        /          |            \
//!  AddressBook  TransactionLedger  TransactionBuilder
//!        \          /
//!       EventRegistry  <- listeners
//! ```
//!
//! The event stream reaches the stores only through the same merge entry
//! points that polling uses.

pub mod address_book;
pub mod events;
pub mod facade;
pub mod transaction_ledger;
pub mod types;

pub use address_book::{AddressBook, SyncTicket};
pub use events::{EventRegistry, SubscriptionId, WalletEvent};
pub use facade::Wallet;
pub use transaction_ledger::{MergeOutcome, TransactionLedger};
pub use types::{
    Address, Amount, Balance, HistoryEntry, ReducedTransaction, TransactionStatus, TrustScore,
};
