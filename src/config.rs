use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::review::{VerificationCode, DEFAULT_VERIFICATION_CODE};
use crate::storage::DEFAULT_STORAGE_KEY;

pub const ENV_MODE: &str = "RATION_LEDGER_MODE";
pub const ENV_DATA_DIR: &str = "RATION_LEDGER_DATA_DIR";
pub const ENV_STORAGE_KEY: &str = "RATION_LEDGER_STORAGE_KEY";
pub const ENV_VERIFICATION_CODE: &str = "RATION_LEDGER_VERIFICATION_CODE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// Which ledger the runtime talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Local,
    Remote,
}

impl FromStr for BackendMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendMode::Local),
            "remote" => Ok(BackendMode::Remote),
            other => Err(ConfigError::InvalidValue(format!("unknown backend mode '{}'", other))),
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Local => f.write_str("local"),
            BackendMode::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the sled database.
    pub path: PathBuf,
    /// Key the record list is stored under.
    pub key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ration_data"),
            key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub mode: BackendMode,
    pub verification_code: String,
    /// Deployer address used for the simulated contract.
    pub contract_owner: String,
    pub storage: StorageConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Local,
            verification_code: DEFAULT_VERIFICATION_CODE.to_string(),
            contract_owner: "0x0000000000000000000000000000000000000001".to_string(),
            storage: StorageConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Defaults, then the TOML file at `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
                debug!(path = %path.display(), "config file read");
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `RATION_LEDGER_*` values returned by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = mode.parse()?;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.storage.path = PathBuf::from(dir);
        }
        if let Some(key) = lookup(ENV_STORAGE_KEY) {
            self.storage.key = key;
        }
        if let Some(code) = lookup(ENV_VERIFICATION_CODE) {
            self.verification_code = code;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.verification_code.is_empty() {
            return Err(ConfigError::InvalidValue("verification_code must not be empty".to_string()));
        }
        if self.storage.key.is_empty() {
            return Err(ConfigError::InvalidValue("storage.key must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn verification_code(&self) -> VerificationCode {
        VerificationCode::new(self.verification_code.clone())
    }
}
