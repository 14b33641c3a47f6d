//! In-memory ledger and trust score node
//!
//! Deterministic stand-ins for the remote services, for tests and offline
//! dry runs. Every call is recorded so callers can assert on traffic.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use super::client::LedgerClient;
use super::trust_score::TrustScoreGateway;
use super::types::{FullNodeFeeRequest, NetworkFeeRequest, TokenDetails};
use crate::config::Network;
use crate::crypto::AddressHex;
use crate::error::{Error, Result};
use crate::transaction::currency::{HardForkFlag, NATIVE_CURRENCY_HASH};
use crate::transaction::model::{BaseLine, LineKind, SubmissionReceipt, Transaction};
use crate::wallet::types::{Amount, Balance, HistoryEntry, TrustScore};

#[derive(Default)]
struct LedgerState {
    balances: HashMap<AddressHex, Balance>,
    token_balances: HashMap<AddressHex, HashMap<String, Balance>>,
    history: Vec<HistoryEntry>,
    tokens: HashMap<String, TokenDetails>,
    submitted: Vec<Transaction>,
    reject_submit: Option<String>,
    calls: Vec<String>,
}

/// Ledger backed by plain maps
pub struct MemoryLedger {
    fee_collector: AddressHex,
    full_node_fee: Amount,
    hard_fork: HardForkFlag,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Legacy ledger that charges no fee
    pub fn new(fee_collector: AddressHex) -> Self {
        Self {
            fee_collector,
            full_node_fee: Amount::ZERO,
            hard_fork: HardForkFlag::Legacy,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn with_full_node_fee(mut self, fee: Amount) -> Self {
        self.full_node_fee = fee;
        self
    }

    pub fn with_hard_fork(mut self, flag: HardForkFlag) -> Self {
        self.hard_fork = flag;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_balance(&self, address: &AddressHex, balance: Balance) {
        self.state().balances.insert(address.clone(), balance);
    }

    pub fn set_token_balance(&self, address: &AddressHex, currency_hash: &str, balance: Balance) {
        self.state()
            .token_balances
            .entry(address.clone())
            .or_default()
            .insert(currency_hash.to_string(), balance);
    }

    pub fn add_history(&self, entry: HistoryEntry) {
        self.state().history.push(entry);
    }

    pub fn add_token(&self, details: TokenDetails) {
        self.state().tokens.insert(details.currency_hash.clone(), details);
    }

    /// Reject every following submission with `message`
    pub fn reject_submissions(&self, message: &str) {
        self.state().reject_submit = Some(message.to_string());
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.state().submitted.clone()
    }

    /// Names of the calls made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, call: &str) {
        self.state().calls.push(call.to_string());
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn get_balances(&self, addresses: &[AddressHex]) -> Result<HashMap<AddressHex, Balance>> {
        self.record("get_balances");
        let state = self.state();
        Ok(addresses
            .iter()
            .map(|a| (a.clone(), state.balances.get(a).copied().unwrap_or_default()))
            .collect())
    }

    async fn get_transaction_history(&self, addresses: &[AddressHex]) -> Result<Vec<HistoryEntry>> {
        self.record("get_transaction_history");
        let wanted: HashSet<&AddressHex> = addresses.iter().collect();
        let mut entries: Vec<HistoryEntry> = self
            .state()
            .history
            .iter()
            .filter(|e| e.addresses.iter().any(|a| wanted.contains(a)))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.transaction.create_time);
        Ok(entries)
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<HistoryEntry>> {
        self.record("get_transaction");
        Ok(self
            .state()
            .history
            .iter()
            .find(|e| e.transaction.hash == hash)
            .cloned())
    }

    async fn get_token_balances(
        &self,
        addresses: &[AddressHex],
        currency_hash: Option<&str>,
    ) -> Result<HashMap<AddressHex, HashMap<String, Balance>>> {
        self.record("get_token_balances");
        if self.hard_fork == HardForkFlag::Legacy {
            return Err(Error::UnsupportedCurrency(
                "token balances require the multi-currency protocol".to_string(),
            ));
        }
        let state = self.state();
        Ok(addresses
            .iter()
            .map(|a| {
                let per_currency = state
                    .token_balances
                    .get(a)
                    .map(|m| {
                        m.iter()
                            .filter(|(c, _)| currency_hash.map_or(true, |wanted| wanted == c.as_str()))
                            .map(|(c, b)| (c.clone(), *b))
                            .collect()
                    })
                    .unwrap_or_default();
                (a.clone(), per_currency)
            })
            .collect())
    }

    async fn get_token_details(&self, currency_hash: &str) -> Result<Option<TokenDetails>> {
        self.record("get_token_details");
        Ok(self.state().tokens.get(currency_hash).cloned())
    }

    async fn get_full_node_fee(&self, request: &FullNodeFeeRequest) -> Result<BaseLine> {
        self.record("get_full_node_fee");
        if request.original_amount <= Amount::ZERO {
            return Err(Error::RejectedByNode("amount must be positive".to_string()));
        }
        let line = BaseLine::new(
            self.fee_collector.clone(),
            self.full_node_fee,
            LineKind::FullNodeFee,
            Utc::now(),
        );
        Ok(match self.hard_fork {
            HardForkFlag::Legacy => line,
            HardForkFlag::MultiCurrency => line.with_currency(NATIVE_CURRENCY_HASH, NATIVE_CURRENCY_HASH),
        })
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<SubmissionReceipt> {
        self.record("submit_transaction");
        let hash = transaction.hash().ok_or(Error::NotSigned)?.to_string();
        let mut state = self.state();
        if let Some(message) = &state.reject_submit {
            return Err(Error::RejectedByNode(message.clone()));
        }
        state.submitted.push(transaction.clone());
        Ok(SubmissionReceipt {
            hash,
            status: "Success".to_string(),
            message: None,
        })
    }

    async fn get_hard_fork_status(&self) -> Result<HardForkFlag> {
        self.record("get_hard_fork_status");
        Ok(self.hard_fork)
    }
}

/// Trust score registry backed by a map
pub struct MemoryTrustScore {
    network: Network,
    network_fee: Amount,
    scores: Mutex<HashMap<String, f64>>,
}

impl MemoryTrustScore {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            network_fee: Amount::ZERO,
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_network_fee(mut self, fee: Amount) -> Self {
        self.network_fee = fee;
        self
    }

    pub fn registered_users(&self) -> usize {
        self.scores.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl TrustScoreGateway for MemoryTrustScore {
    async fn get_trust_score(&self, user_hash: &str) -> Result<TrustScore> {
        let scores = self.scores.lock().unwrap_or_else(PoisonError::into_inner);
        scores
            .get(user_hash)
            .map(|score| TrustScore {
                user_hash: user_hash.to_string(),
                trust_score: *score,
            })
            .ok_or_else(|| Error::UserNotRegistered(user_hash.to_string()))
    }

    async fn register_trust_score(&self, api_key: &str, user_hash: &str) -> Result<TrustScore> {
        if api_key.is_empty() {
            return Err(Error::Validation(
                "an api key is required to register a trust score".to_string(),
            ));
        }
        let mut scores = self.scores.lock().unwrap_or_else(PoisonError::into_inner);
        if scores.contains_key(user_hash) {
            return Err(Error::AlreadyRegistered(user_hash.to_string()));
        }
        scores.insert(user_hash.to_string(), 10.0);
        Ok(TrustScore {
            user_hash: user_hash.to_string(),
            trust_score: 10.0,
        })
    }

    async fn get_network_fee(&self, request: &NetworkFeeRequest) -> Result<BaseLine> {
        let full = &request.full_node_fee_data;
        let mut line = BaseLine::new(
            full.address_hash.clone(),
            self.network_fee,
            LineKind::NetworkFee,
            Utc::now(),
        );
        line.currency_hash = full.currency_hash.clone();
        line.original_currency_hash = full.original_currency_hash.clone();
        Ok(line)
    }

    fn network(&self) -> Network {
        self.network
    }
}
