//! Core types for wallet state
//!
//! Defines tracked addresses, balance snapshots and reduced transactions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::crypto::AddressHex;

/// Exact decimal amount in coti (or token units)
pub type Amount = Decimal;

/// Confirmed and pending balance of one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    /// Confirmed balance
    pub balance: Amount,
    /// Balance including pending transactions
    pub pending_balance: Amount,
}

impl Balance {
    pub fn new(balance: Amount, pending_balance: Amount) -> Self {
        Self {
            balance,
            pending_balance,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.balance.is_zero() && self.pending_balance.is_zero()
    }
}

/// Address tracked by the wallet
///
/// Balances start at zero. Callers that persist balances should seed them
/// with [`Address::with_balance`] before loading, so the first sync only
/// reports real changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    hex: AddressHex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<u32>,
    #[serde(flatten)]
    balance: Balance,
}

impl Address {
    pub fn new(hex: AddressHex) -> Self {
        Self {
            hex,
            index: None,
            balance: Balance::default(),
        }
    }

    /// Address derived at `index`
    pub fn derived(hex: AddressHex, index: u32) -> Self {
        Self {
            index: Some(index),
            ..Self::new(hex)
        }
    }

    /// Seed balances from storage
    pub fn with_balance(mut self, balance: Amount, pending_balance: Amount) -> Self {
        self.balance = Balance::new(balance, pending_balance);
        self
    }

    pub fn hex(&self) -> &AddressHex {
        &self.hex
    }

    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn balance(&self) -> Amount {
        self.balance.balance
    }

    pub fn pending_balance(&self) -> Amount {
        self.balance.pending_balance
    }

    pub fn balances(&self) -> Balance {
        self.balance
    }

    /// Only the address book mutates balances
    pub(crate) fn set_balances(&mut self, balance: Balance) {
        self.balance = balance;
    }
}

/// Consensus status of a transaction. Ordered: `Pending < Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[default]
    #[serde(alias = "PENDING")]
    Pending,
    #[serde(alias = "CONFIRMED")]
    Confirmed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "pending"),
            TransactionStatus::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// Minimal tracked projection of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducedTransaction {
    pub hash: String,

    #[serde(with = "timestamp")]
    pub create_time: DateTime<Utc>,

    #[serde(
        rename = "transactionConsensusUpdateTime",
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_consensus_update_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub status: TransactionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_currency_hash: Option<String>,
}

impl ReducedTransaction {
    pub fn new(
        hash: impl Into<String>,
        create_time: DateTime<Utc>,
        last_consensus_update_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            hash: hash.into(),
            create_time,
            last_consensus_update_time,
            status: TransactionStatus::Pending,
            currency_hash: None,
            original_currency_hash: None,
        }
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_currency(mut self, currency_hash: String, original_currency_hash: String) -> Self {
        self.currency_hash = Some(currency_hash);
        self.original_currency_hash = Some(original_currency_hash);
        self
    }
}

/// A transaction together with the addresses it touches
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub transaction: ReducedTransaction,
    pub addresses: Vec<AddressHex>,
}

impl HistoryEntry {
    pub fn new(transaction: ReducedTransaction, addresses: Vec<AddressHex>) -> Self {
        Self {
            transaction,
            addresses,
        }
    }
}

/// Trust score of a user identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustScore {
    pub user_hash: String,
    pub trust_score: f64,
}

/// Timestamps on the wire are seconds with millisecond decimals
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn to_seconds(time: &DateTime<Utc>) -> f64 {
        time.timestamp_millis() as f64 / 1000.0
    }

    pub fn from_seconds(seconds: f64) -> Option<DateTime<Utc>> {
        if !seconds.is_finite() {
            return None;
        }
        DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64)
    }

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(to_seconds(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        from_seconds(seconds).ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", seconds)))
    }

    pub mod optional {
        use super::*;

        pub fn serialize<S: Serializer>(
            time: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(t) => serializer.serialize_some(&to_seconds(t)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<f64>::deserialize(deserializer)? {
                Some(seconds) => from_seconds(seconds)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", seconds))),
                None => Ok(None),
            }
        }
    }
}
