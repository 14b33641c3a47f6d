//! Transaction assembly and signing
//!
//! ```text
//! TransactionRequest → TransactionBuilder::build → Transaction (unsigned)
//!                                                      ↓ sign
//!                                         Transaction (hashed, signed) → LedgerClient::submit
//! ```

pub mod builder;
pub mod currency;
pub mod model;

pub use builder::{FeeQuote, TransactionBuilder, TransactionRequest};
pub use currency::{HardForkFlag, MultiCurrency, NATIVE_CURRENCY_HASH};
pub use model::{BaseLine, LineKind, SubmissionReceipt, Transaction};
