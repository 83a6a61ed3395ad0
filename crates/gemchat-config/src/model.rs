use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub chat: ChatConfig,
    pub storage: StorageConfig,
    pub credentials: CredentialsConfig,
}

/// Upstream model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub model: String,
    pub base_url: String,
    pub connect_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl ProviderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Longest gap allowed between two fragments; `0` waits forever.
    pub stream_idle_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            stream_idle_timeout_secs: 60,
        }
    }
}

impl ChatConfig {
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.stream_idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `gemchat.db` inside the config directory.
    pub database_path: Option<PathBuf>,
}

/// Where the API key is looked up, in order: environment variables, then
/// the encrypted vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub env_vars: Vec<String>,
    pub vault_path: Option<PathBuf>,
    pub vault_key: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            env_vars: vec!["GEMINI_API_KEY".to_string(), "API_KEY".to_string()],
            vault_path: None,
            vault_key: "gemini_api_key".to_string(),
        }
    }
}
