//! Wire DTOs for the full node and trust score node

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

use crate::crypto::{sign_digest, sign_message, AddressHex, KeyPair, Signature};
use crate::transaction::model::{BaseLine, LineKind};
use crate::wallet::types::{
    timestamp, Amount, Balance, HistoryEntry, ReducedTransaction, TransactionStatus,
};

/// Error body returned with non-2xx statuses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressesRequest {
    pub addresses: Vec<String>,
}

impl AddressesRequest {
    pub fn new(addresses: &[AddressHex]) -> Self {
        Self {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressBalanceDto {
    pub address_balance: Amount,
    pub address_pre_balance: Amount,
}

impl From<AddressBalanceDto> for Balance {
    fn from(dto: AddressBalanceDto) -> Self {
        Balance::new(dto.address_balance, dto.address_pre_balance)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub addresses_balance: HashMap<String, AddressBalanceDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseTransactionDto {
    pub address_hash: String,
    #[serde(default)]
    pub amount: Amount,
    #[serde(default)]
    pub currency_hash: Option<String>,
    #[serde(default)]
    pub original_currency_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DspConsensusDto {
    #[serde(default)]
    pub is_dsp_consensus: bool,
}

/// Full transaction as reported by the node, reduced on arrival
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDataDto {
    pub hash: String,
    #[serde(with = "timestamp")]
    pub create_time: DateTime<Utc>,
    #[serde(default, with = "timestamp::optional")]
    pub transaction_consensus_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trust_chain_consensus: bool,
    #[serde(default)]
    pub dsp_consensus_result: Option<DspConsensusDto>,
    #[serde(default)]
    pub base_transactions: Vec<BaseTransactionDto>,
}

impl TransactionDataDto {
    pub fn status(&self) -> TransactionStatus {
        let dsp = self
            .dsp_consensus_result
            .map(|d| d.is_dsp_consensus)
            .unwrap_or(false);
        if self.trust_chain_consensus && dsp {
            TransactionStatus::Confirmed
        } else {
            TransactionStatus::Pending
        }
    }

    /// Reduce to the tracked projection. Lines with unparsable addresses are
    /// skipped rather than failing the whole history.
    pub fn into_history_entry(self) -> HistoryEntry {
        let status = self.status();
        let currency = self
            .base_transactions
            .iter()
            .find(|line| line.amount.is_sign_positive() && line.currency_hash.is_some())
            .map(|line| (line.currency_hash.clone(), line.original_currency_hash.clone()));

        let mut addresses = BTreeSet::new();
        for line in &self.base_transactions {
            match AddressHex::parse(&line.address_hash) {
                Ok(address) => {
                    addresses.insert(address);
                }
                Err(e) => warn!("Skipping line of {}: {}", self.hash, e),
            }
        }

        let mut reduced = ReducedTransaction::new(
            self.hash,
            self.create_time,
            self.transaction_consensus_update_time,
        )
        .with_status(status);
        if let Some((currency_hash, original_currency_hash)) = currency {
            reduced.currency_hash = currency_hash;
            reduced.original_currency_hash = original_currency_hash;
        }

        HistoryEntry::new(reduced, addresses.into_iter().collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub transactions_data: Vec<TransactionDataDto>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub transaction_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub transaction_data: Option<TransactionDataDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Full node fee quote request, signed by the user key
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullNodeFeeRequest {
    pub original_amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_currency_hash: Option<String>,
    pub user_hash: String,
    pub user_signature: Signature,
    pub fee_included: bool,
}

impl FullNodeFeeRequest {
    pub fn signed(amount: Amount, original_currency_hash: Option<String>, user: &KeyPair) -> Self {
        let mut message = amount.normalize().to_string();
        if let Some(currency) = &original_currency_hash {
            message.push_str(currency);
        }
        Self {
            original_amount: amount,
            original_currency_hash,
            user_hash: user.public_key_hex(),
            user_signature: sign_message(user, message.as_bytes()),
            fee_included: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullNodeFeeResponse {
    #[serde(default)]
    pub status: String,
    pub full_node_fee: BaseLine,
}

/// Network fee quote request for an already quoted full node fee
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFeeRequest {
    pub full_node_fee_data: BaseLine,
    pub user_hash: String,
    pub user_signature: Signature,
}

impl NetworkFeeRequest {
    pub fn signed(full_node_fee: BaseLine, user: &KeyPair) -> Self {
        let digest = full_node_fee.digest();
        Self {
            full_node_fee_data: full_node_fee,
            user_hash: user.public_key_hex(),
            user_signature: sign_digest(user, &digest),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFeeResponse {
    #[serde(default)]
    pub status: String,
    pub network_fee_data: BaseLine,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalancesRequest {
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalancesResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub token_balances: HashMap<String, HashMap<String, AddressBalanceDto>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetailsRequest {
    pub currency_hash: String,
}

/// Token metadata known to the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub currency_hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub scale: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetailsResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub token: Option<TokenDetails>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardForkResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub event_transaction_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustScoreRequest {
    pub user_hash: String,
    pub network: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertUserRequest {
    pub user_hash: String,
    pub network: String,
    pub user_type: String,
}

impl InsertUserRequest {
    pub fn consumer(user_hash: &str, network: &str) -> Self {
        Self {
            user_hash: user_hash.to_string(),
            network: network.to_string(),
            user_type: "consumer".to_string(),
        }
    }
}

/// Check that a node quoted a fee line of the expected kind
pub fn expect_fee_line(line: &BaseLine, kind: LineKind) -> bool {
    line.name == kind && line.amount >= Amount::ZERO
}
