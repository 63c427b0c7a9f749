//! Remote ledger contract surface.
//!
//! [`RationContract`] mirrors the functions and events of the deployed
//! `RationDistribution` contract. Ids are sequential, timestamps are in
//! seconds, and failed calls revert with a reason string.
//! [`SimulatedContract`] provides the same behaviour in process, standing in
//! for a local development chain.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::review::VerificationCode;
use crate::types::now_millis;

pub const REVERT_INVALID_CODE: &str = "Invalid verification code";
pub const REVERT_NOT_FOUND: &str = "Transaction does not exist";
pub const REVERT_ALREADY_REMOVED: &str = "Transaction already removed";
pub const REVERT_NOT_OWNER: &str = "Only owner can perform this action";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// The call reached the contract and was rejected.
    #[error("Execution reverted: {0}")]
    Revert(String),
    /// The call never completed (network, wallet, or node failure).
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Record as returned by `getTransaction`. Review fields are zero values
/// until the record is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractTransaction {
    pub id: u64,
    pub beneficiary_name: String,
    pub beneficiary_id: String,
    pub item_type: String,
    pub quantity: u64,
    pub shop_id: String,
    pub officer_name: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub removed: bool,
    pub removal_reason: String,
    pub verifier_name: String,
    /// Seconds since the Unix epoch, 0 while not removed.
    pub removal_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractStats {
    pub total_transactions: u64,
    pub removed_transactions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    TransactionAdded {
        id: u64,
        beneficiary_id: String,
        item_type: String,
        quantity: u64,
        timestamp: u64,
    },
    TransactionReviewed {
        id: u64,
        reviewer_name: String,
        note: String,
        timestamp: u64,
    },
}

#[async_trait]
pub trait RationContract: Send + Sync {
    /// Submit a new record and wait for inclusion. Returns the assigned id.
    async fn add_transaction(
        &self,
        beneficiary_name: &str,
        beneficiary_id: &str,
        item_type: &str,
        quantity: u64,
        shop_id: &str,
        officer_name: &str,
    ) -> Result<u64, ContractError>;

    async fn request_review(
        &self,
        id: u64,
        verification_code: &str,
        reviewer_name: &str,
        note: &str,
    ) -> Result<(), ContractError>;

    async fn get_transaction_count(&self) -> Result<u64, ContractError>;

    async fn get_transaction(&self, index: u64) -> Result<ContractTransaction, ContractError>;

    async fn get_stats(&self) -> Result<ContractStats, ContractError>;

    async fn owner(&self) -> Result<String, ContractError>;

    /// Stream of events emitted by successful mutations, from any client.
    fn subscribe_events(&self) -> broadcast::Receiver<ContractEvent>;
}

struct ContractState {
    transactions: Vec<ContractTransaction>,
    verification_code: VerificationCode,
    online: bool,
}

/// In-process deployment of the contract.
pub struct SimulatedContract {
    owner: String,
    state: Mutex<ContractState>,
    events: broadcast::Sender<ContractEvent>,
}

impl SimulatedContract {
    pub fn deploy(owner: impl Into<String>, verification_code: VerificationCode) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let owner = owner.into();
        info!(%owner, "simulated contract deployed");
        Self {
            owner,
            state: Mutex::new(ContractState {
                transactions: Vec::new(),
                verification_code,
                online: true,
            }),
            events,
        }
    }

    /// Owner-only rotation of the shared code.
    pub async fn update_verification_code(
        &self,
        caller: &str,
        code: VerificationCode,
    ) -> Result<(), ContractError> {
        let mut state = self.connected_state().await?;
        if caller != self.owner {
            return Err(ContractError::Revert(REVERT_NOT_OWNER.to_string()));
        }
        state.verification_code = code;
        info!("contract verification code updated");
        Ok(())
    }

    /// Make every later call fail with a transport error until brought back.
    pub async fn set_online(&self, online: bool) {
        self.state.lock().await.online = online;
    }

    async fn connected_state(&self) -> Result<tokio::sync::MutexGuard<'_, ContractState>, ContractError> {
        let state = self.state.lock().await;
        if !state.online {
            return Err(ContractError::Transport("node unreachable".to_string()));
        }
        Ok(state)
    }

    /// Edit stored state directly, bypassing the contract rules.
    #[cfg(test)]
    pub(crate) async fn rewrite_transaction<F>(&self, index: usize, edit: F)
    where
        F: FnOnce(&mut ContractTransaction),
    {
        if let Some(transaction) = self.state.lock().await.transactions.get_mut(index) {
            edit(transaction);
        }
    }

    fn emit(&self, event: ContractEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

fn now_seconds() -> u64 {
    now_millis() / 1000
}

#[async_trait]
impl RationContract for SimulatedContract {
    async fn add_transaction(
        &self,
        beneficiary_name: &str,
        beneficiary_id: &str,
        item_type: &str,
        quantity: u64,
        shop_id: &str,
        officer_name: &str,
    ) -> Result<u64, ContractError> {
        let mut state = self.connected_state().await?;
        let id = state.transactions.len() as u64;
        let timestamp = now_seconds();
        state.transactions.push(ContractTransaction {
            id,
            beneficiary_name: beneficiary_name.to_string(),
            beneficiary_id: beneficiary_id.to_string(),
            item_type: item_type.to_string(),
            quantity,
            shop_id: shop_id.to_string(),
            officer_name: officer_name.to_string(),
            timestamp,
            removed: false,
            removal_reason: String::new(),
            verifier_name: String::new(),
            removal_timestamp: 0,
        });
        drop(state);

        debug!(id, "contract transaction added");
        self.emit(ContractEvent::TransactionAdded {
            id,
            beneficiary_id: beneficiary_id.to_string(),
            item_type: item_type.to_string(),
            quantity,
            timestamp,
        });
        Ok(id)
    }

    async fn request_review(
        &self,
        id: u64,
        verification_code: &str,
        reviewer_name: &str,
        note: &str,
    ) -> Result<(), ContractError> {
        let mut state = self.connected_state().await?;
        if !state.verification_code.matches(verification_code) {
            return Err(ContractError::Revert(REVERT_INVALID_CODE.to_string()));
        }
        let transaction = state
            .transactions
            .get_mut(id as usize)
            .ok_or_else(|| ContractError::Revert(REVERT_NOT_FOUND.to_string()))?;
        if transaction.removed {
            return Err(ContractError::Revert(REVERT_ALREADY_REMOVED.to_string()));
        }

        let timestamp = now_seconds();
        transaction.removed = true;
        transaction.removal_reason = note.to_string();
        transaction.verifier_name = reviewer_name.to_string();
        transaction.removal_timestamp = timestamp;
        drop(state);

        debug!(id, "contract transaction reviewed");
        self.emit(ContractEvent::TransactionReviewed {
            id,
            reviewer_name: reviewer_name.to_string(),
            note: note.to_string(),
            timestamp,
        });
        Ok(())
    }

    async fn get_transaction_count(&self) -> Result<u64, ContractError> {
        Ok(self.connected_state().await?.transactions.len() as u64)
    }

    async fn get_transaction(&self, index: u64) -> Result<ContractTransaction, ContractError> {
        self.connected_state()
            .await?
            .transactions
            .get(index as usize)
            .cloned()
            .ok_or_else(|| ContractError::Revert(REVERT_NOT_FOUND.to_string()))
    }

    async fn get_stats(&self) -> Result<ContractStats, ContractError> {
        let state = self.connected_state().await?;
        Ok(ContractStats {
            total_transactions: state.transactions.len() as u64,
            removed_transactions: state.transactions.iter().filter(|t| t.removed).count() as u64,
        })
    }

    async fn owner(&self) -> Result<String, ContractError> {
        let _state = self.connected_state().await?;
        Ok(self.owner.clone())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ContractEvent> {
        self.events.subscribe()
    }
}
