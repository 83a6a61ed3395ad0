use std::path::{Path, PathBuf};

use gemchat_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_FILE: &str = "config.yml";
const DATABASE_FILE: &str = "gemchat.db";
const VAULT_FILE: &str = "credentials.vault";

/// Resolves the configuration directory and reads `config.yml` from it.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Use `~/.gemchat` (or `./.gemchat` when no home directory is known).
    pub fn new() -> Self {
        let config_dir = dirs::home_dir()
            .map(|h| h.join(".gemchat"))
            .unwrap_or_else(|| PathBuf::from(".gemchat"));
        Self { config_dir }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(&self) -> Result<AppConfig> {
        let path = self.config_path();
        if !path.exists() {
            info!("no config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        if raw.trim().is_empty() {
            return Ok(AppConfig::default());
        }
        let config: AppConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn database_path(&self, config: &AppConfig) -> PathBuf {
        config
            .storage
            .database_path
            .clone()
            .unwrap_or_else(|| self.config_dir.join(DATABASE_FILE))
    }

    pub fn vault_path(&self, config: &AppConfig) -> PathBuf {
        config
            .credentials
            .vault_path
            .clone()
            .unwrap_or_else(|| self.config_dir.join(VAULT_FILE))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
