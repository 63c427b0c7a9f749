//! Change notifications for ledger observers.
//!
//! Messages are hints to re-fetch, not deltas: they may be delivered more than
//! once and in any order relative to the call that caused them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// What prompted a notification. Receivers should re-read state either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerChanged {
    TransactionAdded { id: String },
    TransactionReviewed { id: String },
    /// Some notifications were lost; state may have changed in any way.
    Resync,
}

impl LedgerChanged {
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            LedgerChanged::TransactionAdded { id } | LedgerChanged::TransactionReviewed { id } => Some(id.as_str()),
            LedgerChanged::Resync => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end handed out by [`EventBus::subscribe`].
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: UnboundedReceiver<LedgerChanged>,
}

/// Fan-out of [`LedgerChanged`] messages to explicitly registered listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<HashMap<SubscriptionId, UnboundedSender<LedgerChanged>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = unbounded_channel();
        match self.listeners.lock() {
            Ok(mut listeners) => {
                listeners.insert(id, sender);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, sender);
            }
        }
        debug!(?id, "listener subscribed");
        Subscription { id, receiver }
    }

    /// Returns whether `id` was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = match self.listeners.lock() {
            Ok(mut listeners) => listeners.remove(&id),
            Err(poisoned) => poisoned.into_inner().remove(&id),
        };
        debug!(?id, removed = removed.is_some(), "listener unsubscribed");
        removed.is_some()
    }

    /// Deliver `change` to every listener, dropping the ones whose receiver is gone.
    pub fn publish(&self, change: LedgerChanged) {
        let mut listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => {
                warn!("event bus lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        listeners.retain(|_, sender| sender.send(change.clone()).is_ok());
        debug!(listeners = listeners.len(), ?change, "ledger change published");
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.lock() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_ne!(first.id, second.id);

        bus.publish(LedgerChanged::TransactionAdded { id: "1".into() });

        assert_eq!(
            first.receiver.try_recv().unwrap(),
            LedgerChanged::TransactionAdded { id: "1".into() }
        );
        assert_eq!(second.receiver.try_recv().unwrap().transaction_id(), Some("1"));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe();
        assert!(bus.unsubscribe(subscription.id));
        assert!(!bus.unsubscribe(subscription.id));

        bus.publish(LedgerChanged::TransactionReviewed { id: "1".into() });
        assert!(subscription.receiver.try_recv().is_err());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.listener_count(), 2);

        bus.publish(LedgerChanged::TransactionAdded { id: "1".into() });
        assert_eq!(bus.listener_count(), 1);
        drop(kept);
    }
}
