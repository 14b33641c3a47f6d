//! Tracked addresses and their balances
//!
//! The address book is the only writer of balances. Polled snapshots and
//! streamed pushes go through the same change detection. Every poll and
//! every push takes a fresh revision; an address only accepts data newer
//! than the last revision written to it, so neither an earlier poll nor a
//! poll issued before a push can roll a balance back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::events::{EventRegistry, WalletEvent};
use super::types::{Address, Balance};
use crate::crypto::AddressHex;
use crate::error::Result;
use crate::node::LedgerClient;

#[derive(Debug, Clone)]
struct Tracked {
    address: Address,
    /// Revision of the last write
    revision: u64,
}

/// Handle for a balance poll, taken before the network call
#[derive(Debug, Clone)]
pub struct SyncTicket {
    revision: u64,
    addresses: Vec<AddressHex>,
}

impl SyncTicket {
    pub fn addresses(&self) -> &[AddressHex] {
        &self.addresses
    }
}

#[derive(Debug)]
pub struct AddressBook {
    addresses: BTreeMap<AddressHex, Tracked>,
    revision: u64,
    events: Arc<EventRegistry>,
}

impl AddressBook {
    pub fn new(events: Arc<EventRegistry>) -> Self {
        Self {
            addresses: BTreeMap::new(),
            revision: 0,
            events,
        }
    }

    /// Register addresses without fetching. Known addresses are skipped.
    pub fn load(&mut self, addresses: impl IntoIterator<Item = Address>) -> usize {
        addresses
            .into_iter()
            .filter(|address| self.insert(address.clone()))
            .count()
    }

    /// Register one address; false if it was already tracked
    pub fn insert(&mut self, address: Address) -> bool {
        if self.addresses.contains_key(address.hex()) {
            return false;
        }
        debug!("Tracking address {}", address.hex());
        self.addresses.insert(
            address.hex().clone(),
            Tracked {
                address,
                revision: self.revision,
            },
        );
        true
    }

    pub fn get(&self, hex: &AddressHex) -> Option<&Address> {
        self.addresses.get(hex).map(|t| &t.address)
    }

    pub fn contains(&self, hex: &AddressHex) -> bool {
        self.addresses.contains_key(hex)
    }

    pub fn hexes(&self) -> Vec<AddressHex> {
        self.addresses.keys().cloned().collect()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.addresses.values().map(|t| &t.address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Start a poll of every tracked address
    pub fn begin_sync(&mut self) -> SyncTicket {
        let addresses = self.hexes();
        self.ticket_for(addresses)
    }

    /// Start a poll of a subset of addresses
    pub fn ticket_for(&mut self, addresses: Vec<AddressHex>) -> SyncTicket {
        SyncTicket {
            revision: self.next_revision(),
            addresses,
        }
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Merge a polled snapshot. Emits one `BalanceChanged` per changed
    /// address and returns the changed addresses.
    pub fn apply_snapshot(
        &mut self,
        ticket: &SyncTicket,
        snapshot: &HashMap<AddressHex, Balance>,
    ) -> Vec<Address> {
        let mut changed = Vec::new();

        for hex in &ticket.addresses {
            let Some(balance) = snapshot.get(hex) else {
                continue;
            };
            let Some(tracked) = self.addresses.get_mut(hex) else {
                continue;
            };
            if tracked.revision > ticket.revision {
                debug!("Skipping stale snapshot for {}", hex);
                continue;
            }
            tracked.revision = ticket.revision;
            if let Some(address) = self.write(hex, *balance) {
                changed.push(address);
            }
        }

        for address in &changed {
            self.events.emit(&WalletEvent::BalanceChanged(address.clone()));
        }
        changed
    }

    /// Merge a streamed balance for one address. Untracked addresses are
    /// ignored. Returns the address if it changed.
    pub fn apply_push(&mut self, hex: &AddressHex, balance: Balance) -> Option<Address> {
        if !self.addresses.contains_key(hex) {
            debug!("Ignoring balance push for untracked {}", hex);
            return None;
        }

        // A push always counts as newer than any poll in flight
        let revision = self.next_revision();
        if let Some(tracked) = self.addresses.get_mut(hex) {
            tracked.revision = revision;
        }

        let changed = self.write(hex, balance)?;
        self.events.emit(&WalletEvent::BalanceChanged(changed.clone()));
        Some(changed)
    }

    /// Fetch and merge balances of every tracked address.
    ///
    /// Holds `&mut self` across the fetch; callers that share the book use
    /// [`begin_sync`](Self::begin_sync) and [`apply_snapshot`](Self::apply_snapshot)
    /// around an unlocked fetch instead.
    pub async fn sync_balances(&mut self, client: &dyn LedgerClient) -> Result<Vec<Address>> {
        let ticket = self.begin_sync();
        let snapshot = client.get_balances(ticket.addresses()).await?;
        Ok(self.apply_snapshot(&ticket, &snapshot))
    }

    fn write(&mut self, hex: &AddressHex, balance: Balance) -> Option<Address> {
        let tracked = self.addresses.get_mut(hex)?;
        if tracked.address.balances() == balance {
            return None;
        }
        debug!(
            "Balance of {} changed: {} -> {} (pending {} -> {})",
            hex,
            tracked.address.balance(),
            balance.balance,
            tracked.address.pending_balance(),
            balance.pending_balance
        );
        tracked.address.set_balances(balance);
        Some(tracked.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_address_key_pair, Seed};
    use crate::node::MemoryLedger;
    use crate::wallet::types::Amount;
    use std::sync::Mutex;

    fn hex(index: u32) -> AddressHex {
        let seed = Seed::from_bytes(&[21u8; 32]).unwrap();
        derive_address_key_pair(&seed, index).unwrap().to_address()
    }

    fn balance(confirmed: i64, pending: i64) -> Balance {
        Balance::new(Amount::from(confirmed), Amount::from(pending))
    }

    fn book_with_counter() -> (AddressBook, Arc<Mutex<Vec<Address>>>) {
        let events = Arc::new(EventRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            events.on_balance_change(move |a| seen.lock().unwrap().push(a.clone()));
        }
        (AddressBook::new(events), seen)
    }

    #[tokio::test]
    async fn test_second_sync_is_silent() {
        let (mut book, seen) = book_with_counter();
        let ledger = MemoryLedger::new(hex(9));
        ledger.set_balance(&hex(0), balance(10, 10));
        ledger.set_balance(&hex(1), balance(0, 0));

        book.load([Address::new(hex(0)), Address::new(hex(1))]);

        let changed = book.sync_balances(&ledger).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let changed = book.sync_balances(&ledger).await.unwrap();
        assert!(changed.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_seeded_balances_suppress_first_sync() {
        let (mut book, seen) = book_with_counter();
        let ledger = MemoryLedger::new(hex(9));
        ledger.set_balance(&hex(0), balance(7, 8));
        ledger.set_balance(&hex(1), balance(7, 8));

        book.load([
            Address::new(hex(0)).with_balance(Amount::from(7), Amount::from(8)),
            Address::new(hex(1)).with_balance(Amount::from(7), Amount::from(8)),
        ]);
        book.sync_balances(&ledger).await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_load_is_noop() {
        let (mut book, _) = book_with_counter();
        assert_eq!(book.load([Address::new(hex(0)), Address::new(hex(0))]), 1);
        assert!(!book.insert(Address::new(hex(0)).with_balance(Amount::ONE, Amount::ONE)));
        assert_eq!(book.len(), 1);
        assert_eq!(book.get(&hex(0)).unwrap().balance(), Amount::ZERO);
    }

    #[test]
    fn test_push_detects_change() {
        let (mut book, seen) = book_with_counter();
        book.load([Address::new(hex(0))]);

        assert!(book.apply_push(&hex(0), balance(5, 5)).is_some());
        assert!(book.apply_push(&hex(0), balance(5, 5)).is_none());
        assert!(book.apply_push(&hex(1), balance(5, 5)).is_none());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_push_after_poll_start_wins() {
        let (mut book, seen) = book_with_counter();
        book.load([Address::new(hex(0)), Address::new(hex(1))]);

        let ticket = book.begin_sync();
        book.apply_push(&hex(0), balance(20, 25));

        // Poll result was computed before the push landed
        let snapshot = HashMap::from([(hex(0), balance(10, 10)), (hex(1), balance(3, 3))]);
        let changed = book.apply_snapshot(&ticket, &snapshot);

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].hex(), &hex(1));
        assert_eq!(book.get(&hex(0)).unwrap().balance(), Amount::from(20));
        assert_eq!(seen.lock().unwrap().len(), 2);

        // The next poll applies normally
        let ticket = book.begin_sync();
        let snapshot = HashMap::from([(hex(0), balance(10, 10))]);
        assert_eq!(book.apply_snapshot(&ticket, &snapshot).len(), 1);
    }

    #[test]
    fn test_polls_finishing_out_of_order() {
        let (mut book, seen) = book_with_counter();
        book.load([Address::new(hex(0))]);

        let older = book.begin_sync();
        let newer = book.begin_sync();

        let changed = book.apply_snapshot(&newer, &HashMap::from([(hex(0), balance(20, 20))]));
        assert_eq!(changed.len(), 1);

        // The older poll lands last and must not roll the balance back
        let changed = book.apply_snapshot(&older, &HashMap::from([(hex(0), balance(10, 10))]));
        assert!(changed.is_empty());
        assert_eq!(book.get(&hex(0)).unwrap().balance(), Amount::from(20));

        let balances: Vec<Amount> = seen.lock().unwrap().iter().map(|a| a.balance()).collect();
        assert_eq!(balances, vec![Amount::from(20)]);
    }

    #[test]
    fn test_unchanged_newer_poll_still_fences_older_one() {
        let (mut book, seen) = book_with_counter();
        book.load([Address::new(hex(0)).with_balance(Amount::from(20), Amount::from(20))]);

        let older = book.begin_sync();
        let newer = book.begin_sync();

        // Same value as stored: silent, but it is still the latest data
        assert!(book
            .apply_snapshot(&newer, &HashMap::from([(hex(0), balance(20, 20))]))
            .is_empty());
        assert!(book
            .apply_snapshot(&older, &HashMap::from([(hex(0), balance(5, 5))]))
            .is_empty());
        assert_eq!(book.get(&hex(0)).unwrap().balance(), Amount::from(20));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_push_between_two_polls() {
        let (mut book, _) = book_with_counter();
        book.load([Address::new(hex(0))]);

        let before_push = book.begin_sync();
        book.apply_push(&hex(0), balance(30, 30));
        let after_push = book.begin_sync();

        assert!(book
            .apply_snapshot(&before_push, &HashMap::from([(hex(0), balance(1, 1))]))
            .is_empty());
        assert_eq!(
            book.apply_snapshot(&after_push, &HashMap::from([(hex(0), balance(31, 31))]))
                .len(),
            1
        );
        assert_eq!(book.get(&hex(0)).unwrap().balance(), Amount::from(31));
    }
}
