//! Multi-currency protocol upgrade
//!
//! Before the hard fork every line is implicitly in native coti and carries
//! no currency fields. After it, every line is tagged and fees are always
//! paid in native currency.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hash of the ledger's native currency
pub const NATIVE_CURRENCY_HASH: &str = "ae2b227ab7e614b8734be1f03d1532e66bf6caf76accc02ca4da6e28";

/// Currency hash length in hex
pub const CURRENCY_HASH_LEN: usize = 56;

/// Protocol version of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardForkFlag {
    /// Single currency, no currency fields on the wire
    Legacy,
    /// Currency fields required on every line
    MultiCurrency,
}

impl std::fmt::Display for HardForkFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardForkFlag::Legacy => write!(f, "legacy"),
            HardForkFlag::MultiCurrency => write!(f, "multi_currency"),
        }
    }
}

/// Currency selection for a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiCurrency {
    /// Currency being spent
    pub currency_hash: String,
    /// Currency the spend is denominated in originally
    pub original_currency_hash: String,
    /// Protocol version the transaction targets
    pub hard_fork: HardForkFlag,
}

impl MultiCurrency {
    /// Native coti under the multi-currency protocol
    pub fn native() -> Self {
        Self {
            currency_hash: NATIVE_CURRENCY_HASH.to_string(),
            original_currency_hash: NATIVE_CURRENCY_HASH.to_string(),
            hard_fork: HardForkFlag::MultiCurrency,
        }
    }

    /// A token under the multi-currency protocol
    pub fn token(currency_hash: impl Into<String>) -> Self {
        let currency_hash = currency_hash.into();
        Self {
            original_currency_hash: currency_hash.clone(),
            currency_hash,
            hard_fork: HardForkFlag::MultiCurrency,
        }
    }

    pub fn is_native(&self) -> bool {
        is_native(&self.currency_hash)
    }
}

pub fn is_native(currency_hash: &str) -> bool {
    currency_hash.eq_ignore_ascii_case(NATIVE_CURRENCY_HASH)
}

/// Shape check only; whether the node knows the currency is a separate question
pub fn validate_currency_hash(currency_hash: &str) -> Result<()> {
    if currency_hash.len() != CURRENCY_HASH_LEN
        || !currency_hash.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(Error::UnsupportedCurrency(format!(
            "malformed currency hash: {}",
            currency_hash
        )));
    }
    Ok(())
}
