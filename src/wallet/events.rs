//! Listener registry for wallet events
//!
//! Listeners are called synchronously, in registration order, while the
//! emitting store is still locked. Keep them short; hand work off through
//! [`EventRegistry::channel`] when it needs to await.

use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::types::{Address, ReducedTransaction};

/// Change notification
#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    /// Balance or pending balance of a tracked address changed
    BalanceChanged(Address),
    /// A transaction was first seen, or its status / consensus time advanced
    TransactionChanged(ReducedTransaction),
}

/// Handle returned on registration, used to unsubscribe
pub type SubscriptionId = Uuid;

type Listener = Arc<dyn Fn(&WalletEvent) + Send + Sync>;

/// Ordered set of listeners
#[derive(Default)]
pub struct EventRegistry {
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to every event
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&WalletEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        debug!("Registered wallet listener {}", id);
        id
    }

    /// Listen to balance changes only
    pub fn on_balance_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Address) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if let WalletEvent::BalanceChanged(address) = event {
                listener(address);
            }
        })
    }

    /// Listen to new transactions and status changes only
    pub fn on_transaction<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ReducedTransaction) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if let WalletEvent::TransactionChanged(transaction) = event {
                listener(transaction);
            }
        })
    }

    /// Queue every event into an unbounded channel
    pub fn channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<WalletEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Remove a listener. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every listener in registration order
    pub fn emit(&self, event: &WalletEvent) {
        // Snapshot so listeners may (un)subscribe without deadlocking
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    fn tx(hash: &str) -> ReducedTransaction {
        ReducedTransaction::new(hash, Utc::now(), None)
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            registry.subscribe(move |_| seen.lock().unwrap().push(name));
        }

        registry.emit(&WalletEvent::TransactionChanged(tx("aa")));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_filtered_listeners() {
        let registry = EventRegistry::new();
        let hashes = Arc::new(Mutex::new(Vec::new()));
        let balances = Arc::new(Mutex::new(0usize));

        {
            let hashes = hashes.clone();
            registry.on_transaction(move |t| hashes.lock().unwrap().push(t.hash.clone()));
        }
        {
            let balances = balances.clone();
            registry.on_balance_change(move |_| *balances.lock().unwrap() += 1);
        }

        registry.emit(&WalletEvent::TransactionChanged(tx("bb")));
        assert_eq!(*hashes.lock().unwrap(), vec!["bb".to_string()]);
        assert_eq!(*balances.lock().unwrap(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = EventRegistry::new();
        let count = Arc::new(Mutex::new(0));
        let id = {
            let count = count.clone();
            registry.subscribe(move |_| *count.lock().unwrap() += 1)
        };

        registry.emit(&WalletEvent::TransactionChanged(tx("cc")));
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&WalletEvent::TransactionChanged(tx("dd")));

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(registry.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let registry = EventRegistry::new();
        let (_, mut rx) = registry.channel();
        registry.emit(&WalletEvent::TransactionChanged(tx("ee")));

        match rx.recv().await {
            Some(WalletEvent::TransactionChanged(t)) => assert_eq!(t.hash, "ee"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
