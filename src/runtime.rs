use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{BackendError, LedgerBackend, LocalBackend, RemoteBackend};
use crate::config::{BackendMode, ConfigError, LedgerConfig};
use crate::contracts::RationContract;
use crate::ledger::{Ledger, LedgerError};
use crate::storage::{SledStorage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Backend error: {0}")]
    BackendError(#[from] BackendError),
}

/// Owns the backend selected by configuration.
pub struct Runtime {
    config: LedgerConfig,
    backend: Arc<dyn LedgerBackend>,
}

impl Runtime {
    /// Build the configured backend.
    ///
    /// In remote mode a missing or unreachable contract falls back to the
    /// local ledger; a contract that answers but rejects the probe is an error.
    pub async fn start(
        config: LedgerConfig,
        contract: Option<Arc<dyn RationContract>>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let backend: Arc<dyn LedgerBackend> = match (config.mode, contract) {
            (BackendMode::Local, _) => Arc::new(Self::open_local(&config)?),
            (BackendMode::Remote, None) => {
                warn!("remote mode selected but no contract is available, using local ledger");
                Arc::new(Self::open_local(&config)?)
            }
            (BackendMode::Remote, Some(contract)) => match RemoteBackend::connect(contract).await {
                Ok(remote) => Arc::new(remote),
                Err(BackendError::Transport(reason)) => {
                    warn!(%reason, "remote ledger unreachable, using local ledger");
                    Arc::new(Self::open_local(&config)?)
                }
                Err(e) => return Err(e.into()),
            },
        };

        info!(requested = %config.mode, active = %backend.mode(), "runtime started");
        Ok(Runtime { config, backend })
    }

    pub fn open_local(config: &LedgerConfig) -> Result<LocalBackend<SledStorage>, RuntimeError> {
        let storage = SledStorage::open(&config.storage.path, config.storage.key.clone())?;
        if storage.was_recovered() {
            info!(path = %config.storage.path.display(), "opened existing ledger database");
        }
        let ledger = Ledger::open(Arc::new(storage), config.verification_code())?;
        Ok(LocalBackend::new(ledger))
    }

    pub fn backend(&self) -> Arc<dyn LedgerBackend> {
        Arc::clone(&self.backend)
    }

    /// Mode actually in use, which differs from the configured one after a fallback.
    pub fn mode(&self) -> BackendMode {
        self.backend.mode()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}
