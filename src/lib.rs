// src/lib.rs

pub mod types;
pub mod review;
pub mod storage;
pub mod ledger;
pub mod events;
pub mod contracts;
pub mod backend;
pub mod config;
pub mod runtime;

pub use backend::{BackendError, LedgerBackend, LocalBackend, RemoteBackend};
pub use config::{BackendMode, LedgerConfig};
pub use ledger::{Ledger, LedgerError};
pub use types::{LedgerStats, NewTransaction, TransactionRecord};
