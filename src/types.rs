//! Core type definitions for the ration ledger.
//!
//! This module contains the fundamental data structures shared by every
//! backend: distribution records, their review state, the input shape for new
//! records, aggregate statistics, and the content hash that chains records
//! together.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// `previousHash` of the first record in every chain.
pub const GENESIS_HASH: &str = "0";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Generate a fresh local record id: 16 random bytes rendered as lowercase hex.
pub fn generate_record_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fields supplied by the caller when recording a new distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub beneficiary_name: String,
    pub beneficiary_id: String,
    pub item_type: String,
    /// Amount handed out, in kg or liters.
    pub quantity: f64,
    pub shop_id: String,
    pub officer_name: String,
}

impl NewTransaction {
    /// Check the shape callers are expected to enforce before submitting.
    pub fn validate(&self) -> Result<(), String> {
        let text_fields = [
            ("beneficiaryName", &self.beneficiary_name),
            ("beneficiaryId", &self.beneficiary_id),
            ("itemType", &self.item_type),
            ("shopId", &self.shop_id),
            ("officerName", &self.officer_name),
        ];
        for (name, value) in text_fields {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", name));
            }
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(format!("quantity must be a positive number, got {}", self.quantity));
        }
        Ok(())
    }
}

/// Details attached to a record when it leaves the pending state.
#[derive(Debug, Clone, PartialEq)]
pub struct Review {
    pub reviewer_name: String,
    pub reason: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Review state of a record. `Reviewed` is terminal.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ReviewStatus {
    #[default]
    Pending,
    Reviewed(Review),
}

impl ReviewStatus {
    pub fn is_reviewed(&self) -> bool {
        matches!(self, ReviewStatus::Reviewed(_))
    }

    pub fn review(&self) -> Option<&Review> {
        match self {
            ReviewStatus::Pending => None,
            ReviewStatus::Reviewed(review) => Some(review),
        }
    }
}

/// A single distribution event in the ledger.
///
/// Everything except `status` is fixed at creation and covered by `hash`.
/// The persisted form is the flat `removed` field set, see [`StoredRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "StoredRecord", try_from = "StoredRecord")]
pub struct TransactionRecord {
    pub id: String,
    pub beneficiary_name: String,
    pub beneficiary_id: String,
    pub item_type: String,
    pub quantity: f64,
    pub shop_id: String,
    pub officer_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub previous_hash: String,
    pub hash: String,
    pub status: ReviewStatus,
}

impl TransactionRecord {
    /// Build a pending record on top of `previous_hash` and seal it with its hash.
    pub fn new(id: String, fields: NewTransaction, timestamp: u64, previous_hash: String) -> Self {
        let mut record = TransactionRecord {
            id,
            beneficiary_name: fields.beneficiary_name,
            beneficiary_id: fields.beneficiary_id,
            item_type: fields.item_type,
            quantity: fields.quantity,
            shop_id: fields.shop_id,
            officer_name: fields.officer_name,
            timestamp,
            previous_hash,
            hash: String::new(),
            status: ReviewStatus::Pending,
        };
        record.hash = record.calculate_hash();
        record
    }

    /// Concatenation of the hashed fields, in chain order, without separators.
    ///
    /// Field order is part of the chain format: reordering it changes every hash.
    pub fn canonical_string(&self) -> String {
        format!(
            "{}{}{}{}{}{}{}{}{}",
            self.id,
            self.beneficiary_name,
            self.beneficiary_id,
            self.item_type,
            self.quantity,
            self.shop_id,
            self.officer_name,
            self.timestamp,
            self.previous_hash
        )
    }

    /// SHA-256 of [`canonical_string`](Self::canonical_string) as lowercase hex.
    /// The stored `hash` and the review state do not take part.
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn is_reviewed(&self) -> bool {
        self.status.is_reviewed()
    }
}

/// On-disk shape of a record, using the `removed` terminal-state field set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    id: String,
    beneficiary_name: String,
    beneficiary_id: String,
    item_type: String,
    quantity: f64,
    shop_id: String,
    officer_name: String,
    timestamp: u64,
    hash: String,
    previous_hash: String,
    removed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    removal_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    verifier_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    removal_timestamp: Option<u64>,
}

impl From<TransactionRecord> for StoredRecord {
    fn from(record: TransactionRecord) -> Self {
        let (removed, removal_reason, verifier_name, removal_timestamp) = match record.status {
            ReviewStatus::Pending => (false, None, None, None),
            ReviewStatus::Reviewed(review) => (
                true,
                Some(review.reason),
                Some(review.reviewer_name),
                Some(review.timestamp),
            ),
        };
        StoredRecord {
            id: record.id,
            beneficiary_name: record.beneficiary_name,
            beneficiary_id: record.beneficiary_id,
            item_type: record.item_type,
            quantity: record.quantity,
            shop_id: record.shop_id,
            officer_name: record.officer_name,
            timestamp: record.timestamp,
            hash: record.hash,
            previous_hash: record.previous_hash,
            removed,
            removal_reason,
            verifier_name,
            removal_timestamp,
        }
    }
}

impl TryFrom<StoredRecord> for TransactionRecord {
    type Error = String;

    fn try_from(stored: StoredRecord) -> Result<Self, Self::Error> {
        let status = if stored.removed {
            match (stored.verifier_name, stored.removal_reason, stored.removal_timestamp) {
                (Some(reviewer_name), Some(reason), Some(timestamp)) => {
                    ReviewStatus::Reviewed(Review { reviewer_name, reason, timestamp })
                }
                _ => {
                    return Err(format!(
                        "record {} is marked removed but is missing review fields",
                        stored.id
                    ))
                }
            }
        } else {
            ReviewStatus::Pending
        };
        Ok(TransactionRecord {
            id: stored.id,
            beneficiary_name: stored.beneficiary_name,
            beneficiary_id: stored.beneficiary_id,
            item_type: stored.item_type,
            quantity: stored.quantity,
            shop_id: stored.shop_id,
            officer_name: stored.officer_name,
            timestamp: stored.timestamp,
            previous_hash: stored.previous_hash,
            hash: stored.hash,
            status,
        })
    }
}

/// Aggregates over the whole ledger, recomputed on every read.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub total_transactions: u64,
    pub total_beneficiaries: u64,
    pub total_distributions: f64,
    #[serde(rename = "removedTransactions")]
    pub reviewed_transactions: u64,
    pub pending_transactions: u64,
}

impl LedgerStats {
    pub fn from_records(records: &[TransactionRecord]) -> Self {
        let total_transactions = records.len() as u64;
        let total_beneficiaries = records
            .iter()
            .map(|r| r.beneficiary_id.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;
        let total_distributions = records.iter().map(|r| r.quantity).sum();
        let reviewed_transactions = records.iter().filter(|r| r.is_reviewed()).count() as u64;

        LedgerStats {
            total_transactions,
            total_beneficiaries,
            total_distributions,
            reviewed_transactions,
            pending_transactions: total_transactions - reviewed_transactions,
        }
    }
}

/// First point at which a chain stops being self-consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainViolation {
    /// The first record does not point at the genesis sentinel.
    BadGenesis { found: String },
    /// `previousHash` at `position` differs from the hash of the record before it.
    BrokenLink { position: usize, expected: String, found: String },
    /// The stored hash at `position` does not match its recomputed value.
    HashMismatch { position: usize, expected: String, found: String },
}

impl std::fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainViolation::BadGenesis { found } => {
                write!(f, "first record links to {} instead of genesis", found)
            }
            ChainViolation::BrokenLink { position, expected, found } => write!(
                f,
                "record {} links to {}, expected {}",
                position, found, expected
            ),
            ChainViolation::HashMismatch { position, expected, found } => write!(
                f,
                "record {} has hash {}, recomputed {}",
                position, found, expected
            ),
        }
    }
}

/// Check genesis linkage, predecessor linkage, and every stored hash.
pub fn audit_records(records: &[TransactionRecord]) -> Result<(), ChainViolation> {
    let mut expected_previous = GENESIS_HASH;
    for (position, record) in records.iter().enumerate() {
        if record.previous_hash != expected_previous {
            return Err(if position == 0 {
                ChainViolation::BadGenesis { found: record.previous_hash.clone() }
            } else {
                ChainViolation::BrokenLink {
                    position,
                    expected: expected_previous.to_string(),
                    found: record.previous_hash.clone(),
                }
            });
        }

        let recomputed = record.calculate_hash();
        if recomputed != record.hash {
            return Err(ChainViolation::HashMismatch {
                position,
                expected: recomputed,
                found: record.hash.clone(),
            });
        }
        expected_previous = &record.hash;
    }
    Ok(())
}
