//! Wallet engine entry point
//!
//! Owns the address book and transaction ledger. Network calls run outside
//! the store locks; results are merged under them, so a push and a poll for
//! the same address are serialized.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::address_book::AddressBook;
use super::events::{EventRegistry, SubscriptionId};
use super::transaction_ledger::TransactionLedger;
use super::types::{Address, Balance, HistoryEntry, ReducedTransaction, TrustScore};
use crate::config::{Config, Network, StreamConfig};
use crate::crypto::{derive_address_key_pair, AddressHex, KeyPair, Seed};
use crate::error::{Error, Result};
use crate::node::{HttpLedgerClient, HttpTrustScoreGateway, LedgerClient, TrustScoreGateway};
use crate::stream::{Connector, EventStream, StreamHandler};
use crate::transaction::{SubmissionReceipt, Transaction, TransactionBuilder, TransactionRequest};

pub struct Wallet {
    network: Network,
    api_key: String,
    ledger: Arc<dyn LedgerClient>,
    trust: Arc<dyn TrustScoreGateway>,
    events: Arc<EventRegistry>,
    addresses: Arc<Mutex<AddressBook>>,
    transactions: Arc<Mutex<TransactionLedger>>,
    builder: TransactionBuilder,
    stream: RwLock<Option<Arc<EventStream>>>,
}

impl Wallet {
    pub fn new(ledger: Arc<dyn LedgerClient>, trust: Arc<dyn TrustScoreGateway>) -> Self {
        let events = Arc::new(EventRegistry::new());
        Self {
            network: trust.network(),
            api_key: String::new(),
            addresses: Arc::new(Mutex::new(AddressBook::new(events.clone()))),
            transactions: Arc::new(Mutex::new(TransactionLedger::new(events.clone()))),
            builder: TransactionBuilder::new(ledger.clone(), trust.clone()),
            ledger,
            trust,
            events,
            stream: RwLock::new(None),
        }
    }

    /// HTTP-backed wallet for the configured network
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = config.request_timeout();
        let ledger = Arc::new(HttpLedgerClient::new(config.fullnode_url(), timeout)?);
        let trust = Arc::new(HttpTrustScoreGateway::new(
            config.trustscore_url(),
            config.financial_server_url(),
            config.network,
            timeout,
        )?);
        info!("Wallet bound to {} via {}", config.network, config.fullnode_url());
        Ok(Self::new(ledger, trust).with_api_key(&config.wallet.api_key))
    }

    /// Financial server key used for trust score registration
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = api_key.to_string();
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn on_balance_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Address) + Send + Sync + 'static,
    {
        self.events.on_balance_change(listener)
    }

    pub fn on_transaction<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ReducedTransaction) + Send + Sync + 'static,
    {
        self.events.on_transaction(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Register addresses, with balances seeded from storage if known. No fetch.
    pub async fn load_addresses(&self, addresses: impl IntoIterator<Item = Address>) -> usize {
        self.addresses.lock().await.load(addresses)
    }

    /// Seed known transactions. An empty sequence is fine.
    pub async fn load_transactions(&self, transactions: impl IntoIterator<Item = HistoryEntry>) -> usize {
        self.transactions.lock().await.load(transactions)
    }

    /// Poll balances of every tracked address
    pub async fn check_balances(&self) -> Result<Vec<Address>> {
        let ticket = self.addresses.lock().await.begin_sync();
        let snapshot = self.ledger.get_balances(ticket.addresses()).await?;
        let changed = self.addresses.lock().await.apply_snapshot(&ticket, &snapshot);
        debug!("Balance poll: {} of {} changed", changed.len(), ticket.addresses().len());
        Ok(changed)
    }

    /// Poll history of every tracked address
    pub async fn check_transaction_history(&self) -> Result<Vec<ReducedTransaction>> {
        let hexes = self.addresses.lock().await.hexes();
        let history = self.ledger.get_transaction_history(&hexes).await?;
        let changed = self.transactions.lock().await.apply_history(history);
        debug!("History poll: {} transactions changed", changed.len());
        Ok(changed)
    }

    /// Track a new address: register, fetch its balance, subscribe it live.
    /// Returns false if it was already tracked.
    pub async fn set_address(&self, address: Address) -> Result<bool> {
        let hex = address.hex().clone();
        let ticket = {
            let mut book = self.addresses.lock().await;
            if !book.insert(address) {
                return Ok(false);
            }
            book.ticket_for(vec![hex.clone()])
        };

        let snapshot = self.ledger.get_balances(ticket.addresses()).await?;
        self.addresses.lock().await.apply_snapshot(&ticket, &snapshot);

        if let Some(stream) = self.stream() {
            match stream.connect_to_address(&hex) {
                Ok(()) => {}
                // Replayed once the stream connects
                Err(Error::StreamNotConnected(state)) => {
                    debug!("Stream {}; {} will subscribe on connect", state, hex)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Derive address `index` from `seed` and track it
    pub async fn generate_address(&self, seed: &Seed, index: u32) -> Result<Address> {
        let key = derive_address_key_pair(seed, index)?;
        let hex = key.to_address();
        let address = Address::derived(hex.clone(), index);
        self.set_address(address.clone()).await?;
        Ok(self.address(&hex).await.unwrap_or(address))
    }

    pub async fn address(&self, hex: &AddressHex) -> Option<Address> {
        self.addresses.lock().await.get(hex).cloned()
    }

    pub async fn addresses(&self) -> Vec<Address> {
        self.addresses.lock().await.addresses().cloned().collect()
    }

    pub async fn transaction(&self, hash: &str) -> Option<ReducedTransaction> {
        self.transactions.lock().await.get(hash).cloned()
    }

    pub async fn transactions_for(&self, hex: &AddressHex) -> Vec<ReducedTransaction> {
        self.transactions
            .lock()
            .await
            .for_address(hex)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Fetch one transaction from the node and merge it
    pub async fn refresh_transaction(&self, hash: &str) -> Result<Option<ReducedTransaction>> {
        let Some(entry) = self.ledger.get_transaction(hash).await? else {
            return Ok(None);
        };
        let mut ledger = self.transactions.lock().await;
        ledger.apply_push(entry);
        Ok(ledger.get(hash).cloned())
    }

    /// Sum of confirmed and pending balances over tracked addresses
    pub async fn total_balance(&self) -> Balance {
        self.addresses
            .lock()
            .await
            .addresses()
            .fold(Balance::default(), |acc, a| {
                Balance::new(acc.balance + a.balance(), acc.pending_balance + a.pending_balance())
            })
    }

    /// Per-currency balances of tracked addresses (multi-currency nodes only)
    pub async fn token_balances(
        &self,
        currency_hash: Option<&str>,
    ) -> Result<HashMap<AddressHex, HashMap<String, Balance>>> {
        let hexes = self.addresses.lock().await.hexes();
        self.ledger.get_token_balances(&hexes, currency_hash).await
    }

    /// Trust score for `user`, registering it on first use
    pub async fn ensure_trust_score(&self, user: &KeyPair) -> Result<TrustScore> {
        let user_hash = user.public_key_hex();
        match self.trust.get_trust_score(&user_hash).await {
            Ok(score) => Ok(score),
            Err(e) if e.is_not_registered() => {
                info!("User {} has no trust score yet, registering", user_hash);
                self.trust.register_trust_score(&self.api_key, &user_hash).await
            }
            Err(e) => Err(e),
        }
    }

    /// Unsigned transaction for `request`
    pub async fn build_transaction(&self, request: &TransactionRequest, user: &KeyPair) -> Result<Transaction> {
        self.builder.build(request, user).await
    }

    /// Submit a signed transaction and track it as pending. Never retried.
    pub async fn submit(&self, transaction: &Transaction) -> Result<SubmissionReceipt> {
        if !transaction.is_signed() {
            return Err(Error::NotSigned);
        }
        let receipt = self.ledger.submit_transaction(transaction).await?;
        info!("Transaction {} accepted: {}", receipt.hash, receipt.status);
        self.transactions
            .lock()
            .await
            .track_submitted(transaction.to_history_entry()?);
        Ok(receipt)
    }

    /// Build, sign and submit in one go
    pub async fn send_transaction(
        &self,
        request: &TransactionRequest,
        user: &KeyPair,
        address_keys: &[KeyPair],
    ) -> Result<SubmissionReceipt> {
        let mut transaction = self.build_transaction(request, user).await?;
        transaction.sign(user, address_keys)?;
        self.submit(&transaction).await
    }

    /// Handler that routes stream frames into this wallet's stores
    pub fn stream_handler(&self) -> Arc<dyn StreamHandler> {
        Arc::new(WalletStreamHandler {
            addresses: Arc::downgrade(&self.addresses),
            transactions: Arc::downgrade(&self.transactions),
        })
    }

    /// Attach a stream so new addresses get subscribed. Replaces (and closes)
    /// any previous one.
    pub fn attach_stream(&self, stream: EventStream) -> Arc<EventStream> {
        let stream = Arc::new(stream);
        let previous = self
            .stream
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(stream.clone());
        if let Some(previous) = previous {
            warn!("Replacing attached event stream");
            previous.close();
        }
        stream
    }

    /// Create, attach and start an event stream
    pub fn connect_stream<S, F>(
        &self,
        url: &str,
        config: &StreamConfig,
        connector: Arc<dyn Connector>,
        on_connected: S,
        on_failure: F,
    ) -> Result<Arc<EventStream>>
    where
        S: Fn() + Send + Sync + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        let stream = self.attach_stream(EventStream::from_config(
            url,
            config,
            connector,
            self.stream_handler(),
        ));
        stream.connect(on_connected, on_failure)?;
        Ok(stream)
    }

    pub fn stream(&self) -> Option<Arc<EventStream>> {
        self.stream
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn close_stream(&self) {
        if let Some(stream) = self.stream() {
            stream.close();
        }
    }
}

/// Non-owning route from the stream into the stores
struct WalletStreamHandler {
    addresses: Weak<Mutex<AddressBook>>,
    transactions: Weak<Mutex<TransactionLedger>>,
}

#[async_trait::async_trait]
impl StreamHandler for WalletStreamHandler {
    async fn subscribed_addresses(&self) -> Vec<AddressHex> {
        match self.addresses.upgrade() {
            Some(book) => book.lock().await.hexes(),
            None => Vec::new(),
        }
    }

    async fn on_balance(&self, address: AddressHex, balance: Balance) {
        if let Some(book) = self.addresses.upgrade() {
            book.lock().await.apply_push(&address, balance);
        }
    }

    async fn on_transaction(&self, entry: HistoryEntry) {
        if let Some(ledger) = self.transactions.upgrade() {
            ledger.lock().await.apply_push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_user_key_pair;
    use crate::node::{MemoryLedger, MemoryTrustScore};
    use crate::wallet::types::{Amount, TransactionStatus};
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    fn seed() -> Seed {
        Seed::from_bytes(&[51u8; 32]).unwrap()
    }

    fn hex(index: u32) -> AddressHex {
        derive_address_key_pair(&seed(), index).unwrap().to_address()
    }

    fn collector() -> AddressHex {
        derive_address_key_pair(&Seed::from_bytes(&[52u8; 32]).unwrap(), 0)
            .unwrap()
            .to_address()
    }

    fn wallet() -> (Wallet, Arc<MemoryLedger>, Arc<MemoryTrustScore>) {
        let ledger = Arc::new(MemoryLedger::new(collector()).with_full_node_fee(Amount::new(1, 1)));
        let trust = Arc::new(MemoryTrustScore::new(Network::Testnet));
        let wallet = Wallet::new(ledger.clone(), trust.clone()).with_api_key("key");
        (wallet, ledger, trust)
    }

    #[tokio::test]
    async fn test_check_balances_twice() {
        let (wallet, ledger, _) = wallet();
        let seen = Arc::new(StdMutex::new(0));
        {
            let seen = seen.clone();
            wallet.on_balance_change(move |_| *seen.lock().unwrap() += 1);
        }
        ledger.set_balance(&hex(0), Balance::new(Amount::TEN, Amount::TEN));
        wallet.load_addresses([Address::new(hex(0)), Address::new(hex(1))]).await;

        assert_eq!(wallet.check_balances().await.unwrap().len(), 1);
        assert!(wallet.check_balances().await.unwrap().is_empty());
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(wallet.total_balance().await.balance, Amount::TEN);
    }

    #[tokio::test]
    async fn test_set_address_fetches_balance() {
        let (wallet, ledger, _) = wallet();
        ledger.set_balance(&hex(2), Balance::new(Amount::ONE, Amount::TWO));

        let address = wallet.generate_address(&seed(), 2).await.unwrap();
        assert_eq!(address.index(), Some(2));
        assert_eq!(address.pending_balance(), Amount::TWO);

        // Second registration is a no-op
        assert!(!wallet.set_address(Address::new(hex(2))).await.unwrap());
        assert_eq!(wallet.addresses().await.len(), 1);
    }

    #[tokio::test]
    async fn test_history_poll_and_lookup() {
        let (wallet, ledger, _) = wallet();
        wallet.load_addresses([Address::new(hex(0))]).await;
        ledger.add_history(HistoryEntry::new(
            ReducedTransaction::new("h1", Utc::now(), None),
            vec![hex(0)],
        ));

        let changed = wallet.check_transaction_history().await.unwrap();
        assert_eq!(changed.len(), 1);
        assert!(wallet.check_transaction_history().await.unwrap().is_empty());
        assert_eq!(wallet.transactions_for(&hex(0)).await.len(), 1);
        assert!(wallet.refresh_transaction("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trust_score_registered_once() {
        let (wallet, _, trust) = wallet();
        let user = derive_user_key_pair(&seed()).unwrap();

        wallet.ensure_trust_score(&user).await.unwrap();
        wallet.ensure_trust_score(&user).await.unwrap();
        assert_eq!(trust.registered_users(), 1);

        assert!(matches!(
            trust.register_trust_score("key", &user.public_key_hex()).await,
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_send_transaction_tracks_pending() {
        let (wallet, ledger, _) = wallet();
        let user = derive_user_key_pair(&seed()).unwrap();
        let key = derive_address_key_pair(&seed(), 0).unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = seen.clone();
            wallet.on_transaction(move |t| seen.lock().unwrap().push(t.status));
        }

        let request = TransactionRequest::new(hex(5).to_string(), Amount::ONE, hex(0))
            .input(hex(0), Amount::from(5));
        let receipt = wallet
            .send_transaction(&request, &user, &[key])
            .await
            .unwrap();

        assert_eq!(ledger.submitted().len(), 1);
        assert!(ledger.submitted()[0].verify().is_ok());
        let tracked = wallet.transaction(&receipt.hash).await.unwrap();
        assert_eq!(tracked.status, TransactionStatus::Pending);
        assert_eq!(*seen.lock().unwrap(), vec![TransactionStatus::Pending]);
    }

    #[tokio::test]
    async fn test_rejected_submit_is_not_tracked() {
        let (wallet, ledger, _) = wallet();
        ledger.reject_submissions("Balance not enough");
        let user = derive_user_key_pair(&seed()).unwrap();
        let key = derive_address_key_pair(&seed(), 0).unwrap();

        let request = TransactionRequest::new(hex(5).to_string(), Amount::ONE, hex(0))
            .input(hex(0), Amount::from(5));
        let err = wallet.send_transaction(&request, &user, &[key]).await.unwrap_err();

        assert!(matches!(err, Error::RejectedByNode(_)));
        assert!(!err.is_retryable());
        assert_eq!(
            ledger.calls().iter().filter(|c| *c == "submit_transaction").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stream_handler_routes_into_stores() {
        let (wallet, _, _) = wallet();
        wallet.load_addresses([Address::new(hex(0))]).await;
        let handler = wallet.stream_handler();

        assert_eq!(handler.subscribed_addresses().await, vec![hex(0)]);
        handler
            .on_balance(hex(0), Balance::new(Amount::TWO, Amount::TWO))
            .await;
        handler
            .on_transaction(HistoryEntry::new(
                ReducedTransaction::new("s1", Utc::now(), None),
                vec![hex(0)],
            ))
            .await;

        assert_eq!(wallet.address(&hex(0)).await.unwrap().balance(), Amount::TWO);
        assert!(wallet.transaction("s1").await.is_some());

        // Handler does not keep the stores alive
        drop(wallet);
        assert!(handler.subscribed_addresses().await.is_empty());
    }
}
