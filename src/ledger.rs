use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::review::{apply_review, ReviewOutcome, ReviewRequest, VerificationCode};
use crate::storage::{Storage, StorageError};
use crate::types::{
    audit_records, generate_record_id, now_millis, ChainViolation, LedgerStats, NewTransaction,
    ReviewStatus, TransactionRecord, GENESIS_HASH,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Invalid transaction: {0}")]
    Validation(String),
}

/// Hash-chained, append-only list of distribution records.
///
/// Every mutation is written through to `storage` before it returns. If the
/// write fails the in-memory list is put back the way it was.
pub struct Ledger<S: Storage> {
    storage: Arc<S>,
    records: Vec<TransactionRecord>,
    verification_code: VerificationCode,
}

impl<S: Storage> Ledger<S> {
    /// Load whatever `storage` holds under its key, or start an empty chain.
    pub fn open(storage: Arc<S>, verification_code: VerificationCode) -> Result<Self, LedgerError> {
        let records = match storage.load()? {
            Some(records) => {
                info!(key = storage.key(), records = records.len(), "ledger loaded");
                records
            }
            None => {
                info!(key = storage.key(), genesis = GENESIS_HASH, "ledger initialized with genesis marker");
                Vec::new()
            }
        };

        let ledger = Ledger { storage, records, verification_code };
        if let Err(violation) = ledger.audit_chain() {
            warn!(%violation, "loaded ledger fails integrity check");
        }
        Ok(ledger)
    }

    pub fn add_transaction(&mut self, fields: NewTransaction) -> Result<TransactionRecord, LedgerError> {
        fields.validate().map_err(LedgerError::Validation)?;

        let existing: HashSet<&str> = self.records.iter().map(|r| r.id.as_str()).collect();
        let mut id = generate_record_id();
        while existing.contains(id.as_str()) {
            id = generate_record_id();
        }

        let record = TransactionRecord::new(id, fields, now_millis(), self.head_hash().to_string());
        self.records.push(record.clone());

        if let Err(e) = self.storage.save(&self.records) {
            self.records.pop();
            return Err(e.into());
        }

        info!(id = %record.id, hash = %record.hash, beneficiary = %record.beneficiary_id, "transaction added");
        Ok(record)
    }

    /// Review `transaction_id`; `Ok(false)` covers every rejection reason alike.
    ///
    /// A blank reviewer name or note is a [`LedgerError::Validation`].
    pub fn review_transaction(
        &mut self,
        transaction_id: &str,
        supplied_code: &str,
        reviewer_name: &str,
        note: &str,
    ) -> Result<bool, LedgerError> {
        let outcome = self.attempt_review(&ReviewRequest {
            transaction_id,
            supplied_code,
            reviewer_name,
            note,
        })?;
        Ok(outcome.is_applied())
    }

    /// Same transition as [`review_transaction`](Self::review_transaction), but
    /// reports which guard rejected it.
    pub fn attempt_review(&mut self, request: &ReviewRequest<'_>) -> Result<ReviewOutcome, LedgerError> {
        request.validate().map_err(LedgerError::Validation)?;
        let position = self.records.iter().position(|r| r.id == request.transaction_id);
        let record = position.and_then(|p| self.records.get_mut(p));
        let outcome = apply_review(record, request, &self.verification_code, now_millis());

        if let (ReviewOutcome::Applied(_), Some(position)) = (&outcome, position) {
            if let Err(e) = self.storage.save(&self.records) {
                self.records[position].status = ReviewStatus::Pending;
                return Err(e.into());
            }
            info!(id = request.transaction_id, reviewer = request.reviewer_name, "transaction reviewed");
        }
        Ok(outcome)
    }

    /// Copy of every record, in insertion order.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.records.clone()
    }

    pub fn transaction(&self, transaction_id: &str) -> Option<TransactionRecord> {
        self.records.iter().find(|r| r.id == transaction_id).cloned()
    }

    pub fn pending_transactions(&self) -> Vec<TransactionRecord> {
        self.records.iter().filter(|r| !r.is_reviewed()).cloned().collect()
    }

    pub fn reviewed_transactions(&self) -> Vec<TransactionRecord> {
        self.records.iter().filter(|r| r.is_reviewed()).cloned().collect()
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats::from_records(&self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Hash the next record will link to.
    pub fn head_hash(&self) -> &str {
        self.records.last().map_or(GENESIS_HASH, |r| r.hash.as_str())
    }

    pub fn verify_chain_integrity(&self) -> bool {
        self.audit_chain().is_ok()
    }

    pub fn audit_chain(&self) -> Result<(), ChainViolation> {
        let result = audit_records(&self.records);
        debug!(records = self.records.len(), ok = result.is_ok(), "chain audited");
        result
    }

    /// Replace the shared code for all later reviews.
    pub fn rotate_verification_code(&mut self, code: VerificationCode) {
        self.verification_code = code;
        info!("verification code rotated");
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    #[cfg(test)]
    pub(crate) fn records_mut(&mut self) -> &mut Vec<TransactionRecord> {
        &mut self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::ReviewRejection;
    use crate::storage::{MemoryStorage, DEFAULT_STORAGE_KEY};

    const CODE: &str = "GOVT2024";

    fn fields(beneficiary_id: &str, quantity: f64) -> NewTransaction {
        NewTransaction {
            beneficiary_name: format!("Holder of {}", beneficiary_id),
            beneficiary_id: beneficiary_id.to_string(),
            item_type: "Rice".to_string(),
            quantity,
            shop_id: "S1".to_string(),
            officer_name: "O1".to_string(),
        }
    }

    fn open_ledger() -> Ledger<MemoryStorage> {
        Ledger::open(Arc::new(MemoryStorage::new(DEFAULT_STORAGE_KEY)), VerificationCode::default()).unwrap()
    }

    /// Fails every save after being armed.
    struct FailingStorage {
        inner: MemoryStorage,
        fail: std::sync::atomic::AtomicBool,
    }

    impl Storage for FailingStorage {
        fn key(&self) -> &str {
            self.inner.key()
        }

        fn load(&self) -> Result<Option<Vec<TransactionRecord>>, StorageError> {
            self.inner.load()
        }

        fn save(&self, records: &[TransactionRecord]) -> Result<(), StorageError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Poisoned);
            }
            self.inner.save(records)
        }
    }

    #[test]
    fn test_chain_linkage() {
        let mut ledger = open_ledger();
        assert_eq!(ledger.head_hash(), GENESIS_HASH);

        for i in 0..5 {
            ledger.add_transaction(fields(&format!("B{}", i), 1.0 + i as f64)).unwrap();
        }

        let records = ledger.transactions();
        assert_eq!(records[0].previous_hash, GENESIS_HASH);
        for i in 1..records.len() {
            assert_eq!(records[i].previous_hash, records[i - 1].hash);
        }
        assert!(records.iter().all(|r| r.verify_hash()));
        assert_eq!(ledger.head_hash(), records[4].hash);
        assert!(ledger.verify_chain_integrity());
    }

    #[test]
    fn test_ids_are_unique_hex() {
        let mut ledger = open_ledger();
        let ids: HashSet<String> = (0..20)
            .map(|_| ledger.add_transaction(fields("B1", 1.0)).unwrap().id)
            .collect();
        assert_eq!(ids.len(), 20);
        assert!(ids.iter().all(|id| id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn test_add_returns_stored_record() {
        let mut ledger = open_ledger();
        let added = ledger.add_transaction(fields("B1", 10.0)).unwrap();
        assert_eq!(ledger.transaction(&added.id), Some(added.clone()));
        assert_eq!(added.status, ReviewStatus::Pending);
        assert!(added.timestamp > 0);
    }

    #[test]
    fn test_invalid_fields_rejected_without_mutation() {
        let mut ledger = open_ledger();
        let result = ledger.add_transaction(fields("", 10.0));
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        let result = ledger.add_transaction(fields("B1", 0.0));
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert!(ledger.is_empty());
        assert_eq!(ledger.storage().load().unwrap(), None);
    }

    #[test]
    fn test_integrity_detects_any_field_flip() {
        let mut ledger = open_ledger();
        for (b, q) in [("B1", 10.0), ("B2", 20.0), ("B3", 30.0)] {
            ledger.add_transaction(fields(b, q)).unwrap();
        }
        assert!(ledger.verify_chain_integrity());

        let tamperings: Vec<fn(&mut TransactionRecord)> = vec![
            |r: &mut TransactionRecord| r.id.push('x'),
            |r: &mut TransactionRecord| r.beneficiary_name.push('x'),
            |r: &mut TransactionRecord| r.beneficiary_id.push('x'),
            |r: &mut TransactionRecord| r.item_type.push('x'),
            |r: &mut TransactionRecord| r.quantity += 1.0,
            |r: &mut TransactionRecord| r.shop_id.push('x'),
            |r: &mut TransactionRecord| r.officer_name.push('x'),
            |r: &mut TransactionRecord| r.timestamp += 1,
            |r: &mut TransactionRecord| r.previous_hash.push('x'),
            |r: &mut TransactionRecord| r.hash.push('x'),
        ];

        for position in 0..3 {
            for tamper in &tamperings {
                let original = ledger.transactions();
                tamper(&mut ledger.records_mut()[position]);
                assert!(!ledger.verify_chain_integrity(), "tampering at {} went unnoticed", position);
                *ledger.records_mut() = original;
                assert!(ledger.verify_chain_integrity());
            }
        }
    }

    #[test]
    fn test_review_gating() {
        let mut ledger = open_ledger();
        let first = ledger.add_transaction(fields("B1", 10.0)).unwrap();
        let second = ledger.add_transaction(fields("B2", 20.0)).unwrap();
        let before = ledger.transactions();

        assert!(!ledger.review_transaction(&second.id, "WRONG_CODE", "Verifier", "Error").unwrap());
        assert_eq!(ledger.transactions(), before);

        assert!(ledger.review_transaction(&second.id, CODE, "Verifier Adams", "Duplicate entry").unwrap());
        let after = ledger.transactions();
        assert_eq!(after[0], first);

        let reviewed = &after[1];
        let review = reviewed.status.review().unwrap();
        assert_eq!(review.reviewer_name, "Verifier Adams");
        assert_eq!(review.reason, "Duplicate entry");

        let mut unreviewed = reviewed.clone();
        unreviewed.status = ReviewStatus::Pending;
        assert_eq!(unreviewed, second);
        assert!(ledger.verify_chain_integrity());
    }

    #[test]
    fn test_no_double_review() {
        let mut ledger = open_ledger();
        let added = ledger.add_transaction(fields("B1", 10.0)).unwrap();

        assert!(ledger.review_transaction(&added.id, CODE, "First", "first note").unwrap());
        let first_review = ledger.transaction(&added.id).unwrap().status;

        assert!(!ledger.review_transaction(&added.id, CODE, "Second", "second note").unwrap());
        assert_eq!(ledger.transaction(&added.id).unwrap().status, first_review);
    }

    fn request<'a>(transaction_id: &'a str, supplied_code: &'a str) -> ReviewRequest<'a> {
        ReviewRequest {
            transaction_id,
            supplied_code,
            reviewer_name: "V",
            note: "N",
        }
    }

    #[test]
    fn test_review_requires_reviewer_and_note() {
        let mut ledger = open_ledger();
        let added = ledger.add_transaction(fields("B1", 10.0)).unwrap();

        assert!(matches!(
            ledger.review_transaction(&added.id, CODE, "", ""),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.review_transaction(&added.id, CODE, "Verifier", " "),
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(ledger.transaction(&added.id).unwrap().status, ReviewStatus::Pending);
        assert!(ledger.review_transaction(&added.id, CODE, "Verifier", "Duplicate").unwrap());
    }

    #[test]
    fn test_attempt_review_reports_reason() {
        let mut ledger = open_ledger();
        let added = ledger.add_transaction(fields("B1", 10.0)).unwrap();
        assert_eq!(
            ledger.attempt_review(&request("missing", CODE)).unwrap(),
            ReviewOutcome::Rejected(ReviewRejection::NotFound)
        );
        assert_eq!(
            ledger.attempt_review(&request(&added.id, "nope")).unwrap(),
            ReviewOutcome::Rejected(ReviewRejection::InvalidCode)
        );
        assert!(ledger.attempt_review(&request(&added.id, CODE)).unwrap().is_applied());
        assert_eq!(
            ledger.attempt_review(&request(&added.id, CODE)).unwrap(),
            ReviewOutcome::Rejected(ReviewRejection::AlreadyReviewed)
        );
    }

    #[test]
    fn test_stats_scenario() {
        let mut ledger = open_ledger();
        for (b, q) in [("B1", 10.0), ("B2", 20.0), ("B3", 30.0)] {
            ledger.add_transaction(fields(b, q)).unwrap();
        }

        let stats = ledger.stats();
        assert_eq!(stats.total_transactions, 3);
        assert_eq!(stats.total_beneficiaries, 3);
        assert_eq!(stats.total_distributions, 60.0);
        assert_eq!(stats.reviewed_transactions, 0);

        let second_id = ledger.transactions()[1].id.clone();
        assert!(ledger.review_transaction(&second_id, CODE, "Verifier", "Test").unwrap());

        let stats = ledger.stats();
        assert_eq!(stats.total_transactions as usize, ledger.transactions().len());
        assert_eq!(stats.reviewed_transactions, 1);
        assert_eq!(stats.pending_transactions, 2);
        assert_eq!(ledger.reviewed_transactions().len(), 1);
        assert_eq!(ledger.pending_transactions().len(), 2);

        let records = ledger.transactions();
        assert_eq!(records[1].previous_hash, records[0].hash);
        assert!(ledger.verify_chain_integrity());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut ledger = open_ledger();
        ledger.add_transaction(fields("B1", 10.0)).unwrap();

        let mut snapshot = ledger.transactions();
        snapshot[0].quantity = 999.0;
        snapshot.clear();

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.transactions()[0].quantity, 10.0);
    }

    #[test]
    fn test_reload_from_storage() {
        let storage = MemoryStorage::new(DEFAULT_STORAGE_KEY);
        let mut ledger = Ledger::open(Arc::new(storage.clone()), VerificationCode::default()).unwrap();
        let added = ledger.add_transaction(fields("B1", 10.0)).unwrap();
        assert!(ledger.review_transaction(&added.id, CODE, "V", "N").unwrap());
        let saved = ledger.transactions();

        let reopened = Ledger::open(Arc::new(storage), VerificationCode::default()).unwrap();
        assert_eq!(reopened.transactions(), saved);
        assert!(reopened.verify_chain_integrity());
    }

    #[test]
    fn test_rotated_code() {
        let mut ledger = open_ledger();
        let added = ledger.add_transaction(fields("B1", 10.0)).unwrap();
        ledger.rotate_verification_code(VerificationCode::new("NEW-CODE"));

        assert!(!ledger.review_transaction(&added.id, CODE, "V", "N").unwrap());
        assert!(ledger.review_transaction(&added.id, "NEW-CODE", "V", "N").unwrap());
    }

    #[test]
    fn test_failed_save_rolls_back() {
        let storage = Arc::new(FailingStorage {
            inner: MemoryStorage::new(DEFAULT_STORAGE_KEY),
            fail: std::sync::atomic::AtomicBool::new(false),
        });
        let mut ledger = Ledger::open(Arc::clone(&storage), VerificationCode::default()).unwrap();
        let added = ledger.add_transaction(fields("B1", 10.0)).unwrap();
        let before = ledger.transactions();

        storage.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(ledger.add_transaction(fields("B2", 20.0)).is_err());
        assert!(ledger.review_transaction(&added.id, CODE, "V", "N").is_err());
        assert_eq!(ledger.transactions(), before);
        assert_eq!(ledger.head_hash(), added.hash);
    }
}
