//! One ledger interface, two implementations.
//!
//! [`LocalBackend`] drives an in-process [`Ledger`] persisted to a key-value
//! store. [`RemoteBackend`] submits the same operations to a
//! [`RationContract`] and forwards its events to observers. Both publish
//! [`LedgerChanged`] notifications on the same kind of [`EventBus`].

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BackendMode;
use crate::contracts::{ContractError, ContractEvent, ContractTransaction, RationContract};
use crate::events::{EventBus, LedgerChanged, Subscription, SubscriptionId};
use crate::ledger::{Ledger, LedgerError};
use crate::review::ReviewRequest;
use crate::storage::Storage;
use crate::types::{
    audit_records, LedgerStats, NewTransaction, Review, ReviewStatus, TransactionRecord,
    GENESIS_HASH,
};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    /// The remote ledger could not be reached; callers may fall back to local mode.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The remote ledger refused the call.
    #[error("Rejected by remote ledger: {0}")]
    Rejected(String),
}

impl From<ContractError> for BackendError {
    fn from(err: ContractError) -> Self {
        match err {
            ContractError::Revert(reason) => BackendError::Rejected(reason),
            ContractError::Transport(reason) => BackendError::Transport(reason),
        }
    }
}

impl BackendError {
    pub fn is_transport(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }
}

#[async_trait]
pub trait LedgerBackend: Send + Sync {
    fn mode(&self) -> BackendMode;

    async fn add_transaction(&self, fields: NewTransaction) -> Result<TransactionRecord, BackendError>;

    /// `Ok(false)` when the record is missing, already reviewed, or the code is wrong.
    /// A blank reviewer name or note is a validation error.
    async fn review_transaction(
        &self,
        transaction_id: &str,
        verification_code: &str,
        reviewer_name: &str,
        note: &str,
    ) -> Result<bool, BackendError>;

    async fn transactions(&self) -> Result<Vec<TransactionRecord>, BackendError>;

    async fn stats(&self) -> Result<LedgerStats, BackendError>;

    /// Recompute every hash and link.
    ///
    /// The remote backend derives its chain from the fetched records, so there
    /// this also reports `false` when a record seen by an earlier call has
    /// changed or disappeared.
    async fn verify_chain_integrity(&self) -> Result<bool, BackendError>;

    fn subscribe(&self) -> Subscription;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

pub struct LocalBackend<S: Storage> {
    ledger: Mutex<Ledger<S>>,
    bus: EventBus,
}

impl<S: Storage> LocalBackend<S> {
    pub fn new(ledger: Ledger<S>) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            bus: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }
}

#[async_trait]
impl<S: Storage> LedgerBackend for LocalBackend<S> {
    fn mode(&self) -> BackendMode {
        BackendMode::Local
    }

    async fn add_transaction(&self, fields: NewTransaction) -> Result<TransactionRecord, BackendError> {
        let record = self.ledger.lock().await.add_transaction(fields)?;
        self.bus.publish(LedgerChanged::TransactionAdded { id: record.id.clone() });
        Ok(record)
    }

    async fn review_transaction(
        &self,
        transaction_id: &str,
        verification_code: &str,
        reviewer_name: &str,
        note: &str,
    ) -> Result<bool, BackendError> {
        let applied = self.ledger.lock().await.review_transaction(
            transaction_id,
            verification_code,
            reviewer_name,
            note,
        )?;
        if applied {
            self.bus.publish(LedgerChanged::TransactionReviewed { id: transaction_id.to_string() });
        }
        Ok(applied)
    }

    async fn transactions(&self) -> Result<Vec<TransactionRecord>, BackendError> {
        Ok(self.ledger.lock().await.transactions())
    }

    async fn stats(&self) -> Result<LedgerStats, BackendError> {
        Ok(self.ledger.lock().await.stats())
    }

    async fn verify_chain_integrity(&self) -> Result<bool, BackendError> {
        Ok(self.ledger.lock().await.verify_chain_integrity())
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }
}

/// Ledger backed by a deployed contract.
pub struct RemoteBackend {
    contract: Arc<dyn RationContract>,
    bus: EventBus,
    forwarder: JoinHandle<()>,
    /// Hashes from the last successful integrity check, in contract order.
    verified_hashes: StdMutex<Vec<String>>,
}

impl RemoteBackend {
    /// Probe the contract and start forwarding its events.
    pub async fn connect(contract: Arc<dyn RationContract>) -> Result<Self, BackendError> {
        let count = contract.get_transaction_count().await?;
        let owner = contract.owner().await?;
        info!(%owner, transactions = count, "connected to remote ledger");

        let bus = EventBus::new();
        let forwarder = tokio::spawn(forward_events(contract.subscribe_events(), bus.clone()));
        Ok(Self {
            contract,
            bus,
            forwarder,
            verified_hashes: StdMutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    async fn fetch_all(&self) -> Result<Vec<ContractTransaction>, BackendError> {
        let count = self.contract.get_transaction_count().await?;
        debug!(count, "fetching remote transactions");
        let mut transactions = Vec::with_capacity(count as usize);
        for index in 0..count {
            transactions.push(self.contract.get_transaction(index).await?);
        }
        Ok(transactions)
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn forward_events(
    mut events: tokio::sync::broadcast::Receiver<ContractEvent>,
    bus: EventBus,
) {
    loop {
        match events.recv().await {
            Ok(ContractEvent::TransactionAdded { id, .. }) => {
                bus.publish(LedgerChanged::TransactionAdded { id: id.to_string() });
            }
            Ok(ContractEvent::TransactionReviewed { id, .. }) => {
                bus.publish(LedgerChanged::TransactionReviewed { id: id.to_string() });
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "contract events lagged");
                bus.publish(LedgerChanged::Resync);
            }
            Err(RecvError::Closed) => {
                debug!("contract event stream closed");
                break;
            }
        }
    }
}

/// Convert contract records and derive their hash chain client-side.
///
/// The contract stores no hashes, so linkage is recomputed over the fetched
/// list in index order starting from the genesis marker.
pub fn records_from_contract(transactions: Vec<ContractTransaction>) -> Vec<TransactionRecord> {
    let mut previous_hash = GENESIS_HASH.to_string();
    transactions
        .into_iter()
        .map(|t| {
            let status = if t.removed {
                ReviewStatus::Reviewed(Review {
                    reviewer_name: t.verifier_name,
                    reason: t.removal_reason,
                    timestamp: t.removal_timestamp.saturating_mul(1000),
                })
            } else {
                ReviewStatus::Pending
            };
            let fields = NewTransaction {
                beneficiary_name: t.beneficiary_name,
                beneficiary_id: t.beneficiary_id,
                item_type: t.item_type,
                quantity: t.quantity as f64,
                shop_id: t.shop_id,
                officer_name: t.officer_name,
            };
            let timestamp = t.timestamp.saturating_mul(1000);
            let mut record = TransactionRecord::new(t.id.to_string(), fields, timestamp, previous_hash.clone());
            record.status = status;
            previous_hash = record.hash.clone();
            record
        })
        .collect()
}

/// On-chain quantities are unsigned integers.
fn whole_quantity(quantity: f64) -> Result<u64, BackendError> {
    if quantity.fract() != 0.0 || quantity >= u64::MAX as f64 {
        return Err(LedgerError::Validation(format!(
            "quantity must be a whole number on-chain, got {}",
            quantity
        ))
        .into());
    }
    Ok(quantity as u64)
}

#[async_trait]
impl LedgerBackend for RemoteBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Remote
    }

    async fn add_transaction(&self, fields: NewTransaction) -> Result<TransactionRecord, BackendError> {
        fields.validate().map_err(LedgerError::Validation)?;
        let quantity = whole_quantity(fields.quantity)?;

        let id = self
            .contract
            .add_transaction(
                &fields.beneficiary_name,
                &fields.beneficiary_id,
                &fields.item_type,
                quantity,
                &fields.shop_id,
                &fields.officer_name,
            )
            .await?;
        info!(id, "transaction added to remote ledger");
        self.bus.publish(LedgerChanged::TransactionAdded { id: id.to_string() });

        let id = id.to_string();
        self.transactions()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| BackendError::Rejected(format!("transaction {} missing after inclusion", id)))
    }

    async fn review_transaction(
        &self,
        transaction_id: &str,
        verification_code: &str,
        reviewer_name: &str,
        note: &str,
    ) -> Result<bool, BackendError> {
        ReviewRequest {
            transaction_id,
            supplied_code: verification_code,
            reviewer_name,
            note,
        }
        .validate()
        .map_err(LedgerError::Validation)?;

        // Contract ids are rendered in plain decimal, so "01" or "+1" name no record.
        let id = match transaction_id.parse::<u64>() {
            Ok(id) if id.to_string() == transaction_id => id,
            _ => {
                debug!(transaction_id, "review rejected: not a contract id");
                return Ok(false);
            }
        };

        match self
            .contract
            .request_review(id, verification_code, reviewer_name, note)
            .await
        {
            Ok(()) => {
                info!(id, reviewer = reviewer_name, "transaction reviewed on remote ledger");
                self.bus.publish(LedgerChanged::TransactionReviewed { id: id.to_string() });
                Ok(true)
            }
            Err(ContractError::Revert(reason)) => {
                debug!(id, %reason, "review rejected by remote ledger");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn transactions(&self) -> Result<Vec<TransactionRecord>, BackendError> {
        Ok(records_from_contract(self.fetch_all().await?))
    }

    async fn stats(&self) -> Result<LedgerStats, BackendError> {
        let remote = self.contract.get_stats().await?;
        let local = LedgerStats::from_records(&self.transactions().await?);
        Ok(LedgerStats {
            total_transactions: remote.total_transactions,
            reviewed_transactions: remote.removed_transactions,
            pending_transactions: remote.total_transactions.saturating_sub(remote.removed_transactions),
            ..local
        })
    }

    async fn verify_chain_integrity(&self) -> Result<bool, BackendError> {
        let records = self.transactions().await?;
        if let Err(violation) = audit_records(&records) {
            warn!(%violation, "remote records fail integrity check");
            return Ok(false);
        }

        let mut verified = match self.verified_hashes.lock() {
            Ok(verified) => verified,
            Err(poisoned) => poisoned.into_inner(),
        };
        let unchanged = verified.len() <= records.len()
            && verified.iter().zip(&records).all(|(hash, record)| *hash == record.hash);
        if !unchanged {
            warn!(verified = verified.len(), fetched = records.len(), "remote records changed since last check");
            return Ok(false);
        }
        *verified = records.into_iter().map(|r| r.hash).collect();
        Ok(true)
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }
}
