use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use sled::{Db, Tree};
use thiserror::Error;
use tracing::debug;

use crate::types::TransactionRecord;

/// Key the reference dashboard stores its ledger under.
pub const DEFAULT_STORAGE_KEY: &str = "rationBlockchain";

const LEDGER_TREE: &str = "ledger";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// A single key-value slot holding the whole ordered record list.
///
/// `save` replaces the slot in one write; readers never see a partial list.
pub trait Storage: Send + Sync {
    fn key(&self) -> &str;
    fn load(&self) -> Result<Option<Vec<TransactionRecord>>, StorageError>;
    fn save(&self, records: &[TransactionRecord]) -> Result<(), StorageError>;
}

pub struct SledStorage {
    db: Db,
    ledger_tree: Tree,
    key: String,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>, key: impl Into<String>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            ledger_tree: db.open_tree(LEDGER_TREE)?,
            key: key.into(),
            db,
        })
    }

    /// Throwaway database removed on drop.
    pub fn temporary(key: impl Into<String>) -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            ledger_tree: db.open_tree(LEDGER_TREE)?,
            key: key.into(),
            db,
        })
    }

    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }
}

impl Storage for SledStorage {
    fn key(&self) -> &str {
        &self.key
    }

    fn load(&self) -> Result<Option<Vec<TransactionRecord>>, StorageError> {
        let encoded = self.ledger_tree.get(&self.key)?;
        Ok(encoded.map(|e| serde_json::from_slice(&e)).transpose()?)
    }

    fn save(&self, records: &[TransactionRecord]) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(records)?;
        self.ledger_tree.insert(self.key.as_bytes(), encoded)?;
        let flushed = self.ledger_tree.flush()?;
        debug!(key = %self.key, records = records.len(), flushed, "ledger saved");
        Ok(())
    }
}

/// In-process store. Clones share the same slots, so a second ledger opened
/// on a clone sees what the first one saved.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    slots: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    key: String,
}

impl MemoryStorage {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            slots: Arc::default(),
            key: key.into(),
        }
    }

    /// Another view over the same slots under a different key.
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            key: key.into(),
        }
    }

    /// Raw blob under this store's key, for inspecting what was persisted.
    pub fn raw(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let slots = self.slots.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(slots.get(&self.key).cloned())
    }

    /// Overwrite the blob under this store's key without going through `save`.
    pub fn put_raw(&self, bytes: Vec<u8>) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().map_err(|_| StorageError::Poisoned)?;
        slots.insert(self.key.clone(), bytes);
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn key(&self) -> &str {
        &self.key
    }

    fn load(&self) -> Result<Option<Vec<TransactionRecord>>, StorageError> {
        Ok(self.raw()?.map(|e| serde_json::from_slice(&e)).transpose()?)
    }

    fn save(&self, records: &[TransactionRecord]) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(records)?;
        self.put_raw(encoded)
    }
}
