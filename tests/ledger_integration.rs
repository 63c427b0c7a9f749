use std::sync::Arc;

use ration_ledger::config::LedgerConfig;
use ration_ledger::review::VerificationCode;
use ration_ledger::runtime::Runtime;
use ration_ledger::storage::{SledStorage, Storage};
use ration_ledger::types::GENESIS_HASH;
use ration_ledger::{Ledger, NewTransaction};

fn distribution(name: &str, id: &str, item: &str, quantity: f64) -> NewTransaction {
    NewTransaction {
        beneficiary_name: name.to_string(),
        beneficiary_id: id.to_string(),
        item_type: item.to_string(),
        quantity,
        shop_id: "SHOP001".to_string(),
        officer_name: "Officer Smith".to_string(),
    }
}

fn config_in(dir: &std::path::Path) -> LedgerConfig {
    let mut config = LedgerConfig::default();
    config.storage.path = dir.join("ledger-db");
    config
}

#[test]
fn ledger_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    let (first_id, head) = {
        let storage = Arc::new(SledStorage::open(&path, "rationBlockchain").unwrap());
        let mut ledger = Ledger::open(storage, VerificationCode::default()).unwrap();
        let first = ledger.add_transaction(distribution("John Doe", "BEN123", "Rice", 10.0)).unwrap();
        ledger.add_transaction(distribution("Jane Roe", "BEN456", "Wheat", 2.5)).unwrap();
        assert!(ledger.review_transaction(&first.id, "GOVT2024", "Inspector", "duplicate").unwrap());
        (first.id, ledger.head_hash().to_string())
    };

    let storage = Arc::new(SledStorage::open(&path, "rationBlockchain").unwrap());
    let ledger = Ledger::open(storage, VerificationCode::default()).unwrap();

    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger.head_hash(), head);
    assert!(ledger.verify_chain_integrity());

    let first = ledger.transaction(&first_id).unwrap();
    assert_eq!(first.previous_hash, GENESIS_HASH);
    let review = first.status.review().unwrap();
    assert_eq!(review.reviewer_name, "Inspector");
    assert_eq!(review.reason, "duplicate");

    let stats = ledger.stats();
    assert_eq!(stats.total_transactions, 2);
    assert_eq!(stats.reviewed_transactions, 1);
    assert_eq!(stats.pending_transactions, 1);
    assert_eq!(stats.total_distributions, 12.5);
}

#[test]
fn storage_keys_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let storage = Arc::new(SledStorage::open(&path, "districtA").unwrap());
        let mut ledger = Ledger::open(storage, VerificationCode::default()).unwrap();
        ledger.add_transaction(distribution("John Doe", "BEN123", "Rice", 10.0)).unwrap();
    }

    let other = SledStorage::open(&path, "districtB").unwrap();
    assert_eq!(other.key(), "districtB");
    assert!(other.load().unwrap().is_none());
}

#[test]
fn persisted_json_uses_flat_removed_fields() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SledStorage::open(dir.path().join("db"), "rationBlockchain").unwrap());
    let mut ledger = Ledger::open(Arc::clone(&storage), VerificationCode::default()).unwrap();
    let record = ledger.add_transaction(distribution("John Doe", "BEN123", "Rice", 10.0)).unwrap();
    ledger.review_transaction(&record.id, "GOVT2024", "Inspector", "wrong shop").unwrap();

    let json = serde_json::to_value(storage.load().unwrap().unwrap()).unwrap();
    let stored = &json[0];
    assert_eq!(stored["beneficiaryId"], "BEN123");
    assert_eq!(stored["previousHash"], "0");
    assert_eq!(stored["removed"], true);
    assert_eq!(stored["verifierName"], "Inspector");
    assert_eq!(stored["removalReason"], "wrong shop");
}

#[tokio::test]
async fn runtime_round_trip_through_backend() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let runtime = Runtime::start(config_in(dir.path()), None).await.unwrap();
        let backend = runtime.backend();
        let mut subscription = backend.subscribe();

        let record = backend
            .add_transaction(distribution("John Doe", "BEN123", "Rice", 10.0))
            .await
            .unwrap();
        assert_eq!(subscription.receiver.recv().await.unwrap().transaction_id(), Some(record.id.as_str()));

        assert!(!backend.review_transaction(&record.id, "WRONG", "Inspector", "x").await.unwrap());
        assert!(backend.review_transaction(&record.id, "GOVT2024", "Inspector", "x").await.unwrap());
        assert!(!backend.review_transaction(&record.id, "GOVT2024", "Inspector", "x").await.unwrap());
        record.id
    };

    let runtime = Runtime::start(config_in(dir.path()), None).await.unwrap();
    let backend = runtime.backend();
    let records = backend.transactions().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert!(records[0].is_reviewed());
    assert!(backend.verify_chain_integrity().await.unwrap());
}
