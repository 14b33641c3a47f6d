//! Known transactions, keyed by hash
//!
//! Merges are monotonic: status only moves from pending to confirmed, the
//! consensus update time only moves forward and the create time never
//! changes. Polls and pushes share the same merge.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::events::{EventRegistry, WalletEvent};
use super::types::{HistoryEntry, ReducedTransaction, TransactionStatus};
use crate::crypto::AddressHex;
use crate::error::Result;
use crate::node::LedgerClient;

/// Result of merging one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }
}

#[derive(Debug)]
pub struct TransactionLedger {
    transactions: HashMap<String, ReducedTransaction>,
    by_address: HashMap<AddressHex, BTreeSet<String>>,
    events: Arc<EventRegistry>,
}

impl TransactionLedger {
    pub fn new(events: Arc<EventRegistry>) -> Self {
        Self {
            transactions: HashMap::new(),
            by_address: HashMap::new(),
            events,
        }
    }

    /// Seed known state. Silent; an empty sequence is fine.
    pub fn load(&mut self, transactions: impl IntoIterator<Item = HistoryEntry>) -> usize {
        let mut loaded = 0;
        for entry in transactions {
            if self.merge(entry).changed() {
                loaded += 1;
            }
        }
        loaded
    }

    /// Merge without notifying
    pub fn merge(&mut self, entry: HistoryEntry) -> MergeOutcome {
        let HistoryEntry {
            transaction: incoming,
            addresses,
        } = entry;

        for address in addresses {
            self.by_address
                .entry(address)
                .or_default()
                .insert(incoming.hash.clone());
        }

        let Some(stored) = self.transactions.get_mut(&incoming.hash) else {
            self.transactions.insert(incoming.hash.clone(), incoming);
            return MergeOutcome::Inserted;
        };

        if incoming.status < stored.status {
            debug!(
                "Ignoring {} update for {} already {}",
                incoming.status, incoming.hash, stored.status
            );
            return MergeOutcome::Unchanged;
        }

        let mut changed = false;
        if incoming.status > stored.status {
            stored.status = incoming.status;
            changed = true;
        }
        if incoming.last_consensus_update_time > stored.last_consensus_update_time {
            stored.last_consensus_update_time = incoming.last_consensus_update_time;
            changed = true;
        }
        if stored.currency_hash.is_none() && incoming.currency_hash.is_some() {
            stored.currency_hash = incoming.currency_hash;
            stored.original_currency_hash = incoming.original_currency_hash;
            changed = true;
        }

        if changed {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Merge one streamed update, notifying if stored state changed
    pub fn apply_push(&mut self, entry: HistoryEntry) -> MergeOutcome {
        let hash = entry.transaction.hash.clone();
        let outcome = self.merge(entry);
        if outcome.changed() {
            debug!("Transaction {} {:?} by push", hash, outcome);
            self.notify(&hash);
        }
        outcome
    }

    /// Merge a polled history, notifying once per changed transaction.
    /// Returns the changed transactions in history order.
    pub fn apply_history(&mut self, history: Vec<HistoryEntry>) -> Vec<ReducedTransaction> {
        let mut changed = Vec::new();
        for entry in history {
            let hash = entry.transaction.hash.clone();
            if self.merge(entry).changed() {
                if let Some(tx) = self.transactions.get(&hash) {
                    changed.push(tx.clone());
                }
            }
        }
        for tx in &changed {
            self.events.emit(&WalletEvent::TransactionChanged(tx.clone()));
        }
        changed
    }

    /// Fetch and merge the history of `addresses`
    pub async fn sync_history(
        &mut self,
        client: &dyn LedgerClient,
        addresses: &[AddressHex],
    ) -> Result<Vec<ReducedTransaction>> {
        let history = client.get_transaction_history(addresses).await?;
        Ok(self.apply_history(history))
    }

    /// Record a transaction we just submitted, as pending
    pub fn track_submitted(&mut self, mut entry: HistoryEntry) -> MergeOutcome {
        entry.transaction.status = TransactionStatus::Pending;
        self.apply_push(entry)
    }

    pub fn get(&self, hash: &str) -> Option<&ReducedTransaction> {
        self.transactions.get(hash)
    }

    /// Transactions touching `address`, ascending by create time
    pub fn for_address(&self, address: &AddressHex) -> Vec<&ReducedTransaction> {
        let mut out: Vec<&ReducedTransaction> = self
            .by_address
            .get(address)
            .into_iter()
            .flatten()
            .filter_map(|hash| self.transactions.get(hash))
            .collect();
        out.sort_by_key(|tx| tx.create_time);
        out
    }

    pub fn all(&self) -> impl Iterator<Item = &ReducedTransaction> {
        self.transactions.values()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn notify(&self, hash: &str) {
        if let Some(tx) = self.transactions.get(hash) {
            self.events.emit(&WalletEvent::TransactionChanged(tx.clone()));
        }
    }
}
