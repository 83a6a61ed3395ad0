use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result, bail};
use dialoguer::Password;
use gemchat_config::{AppConfig, ConfigLoader};
use gemchat_security::{
    ChainedCredential, CredentialLookup, EnvCredential, VAULT_PASSPHRASE_ENV, VaultCredential,
    try_vault_set,
};

/// Where the API key comes from and where a new one is stored.
///
/// A key entered during a chat takes precedence over every configured
/// source for the rest of the process.
#[derive(Clone)]
pub struct KeyStore {
    vault_path: PathBuf,
    vault_key: String,
    entered: Arc<RwLock<Option<String>>>,
    configured: Arc<ChainedCredential>,
}

impl KeyStore {
    pub fn new(loader: &ConfigLoader, config: &AppConfig) -> Self {
        let vault_path = loader.vault_path(config);
        let vault_key = config.credentials.vault_key.clone();
        let configured = ChainedCredential::new()
            .with(Arc::new(EnvCredential::new(
                config.credentials.env_vars.iter().cloned(),
            )))
            .with(Arc::new(VaultCredential::new(&vault_path, &vault_key)));

        Self {
            vault_path,
            vault_key,
            entered: Arc::new(RwLock::new(None)),
            configured: Arc::new(configured),
        }
    }

    /// Lookup handed to the provider; consulted on every request.
    pub fn lookup(&self) -> Arc<dyn CredentialLookup> {
        let entered = Arc::clone(&self.entered);
        let configured = Arc::clone(&self.configured);
        Arc::new(move || {
            let entered = entered
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            entered.or_else(|| configured.lookup())
        })
    }

    pub fn has_key(&self) -> bool {
        self.lookup().lookup().is_some()
    }

    /// Ask for a key, use it from now on and store it in the vault when a
    /// passphrase is available.
    pub fn reconnect(&self) -> Result<()> {
        let key = prompt_key()?;
        *self.entered.write().unwrap_or_else(PoisonError::into_inner) = Some(key.clone());

        match std::env::var(VAULT_PASSPHRASE_ENV) {
            Ok(passphrase) if !passphrase.trim().is_empty() => {
                self.store(passphrase.trim(), &key)?;
                println!("Key saved to {}.", self.vault_path.display());
            }
            _ => println!("Key set for this session. Use `gemchat key set` to keep it."),
        }
        Ok(())
    }

    /// `gemchat key set`: prompt for the key and the vault passphrase.
    pub fn set_interactive(&self) -> Result<()> {
        let key = prompt_key()?;
        let passphrase = match std::env::var(VAULT_PASSPHRASE_ENV) {
            Ok(p) if !p.trim().is_empty() => p.trim().to_string(),
            _ => Password::new()
                .with_prompt("Vault passphrase")
                .with_confirmation("Confirm passphrase", "Passphrases do not match")
                .interact()
                .context("failed to read passphrase")?,
        };

        self.store(&passphrase, &key)?;
        println!("Key saved to {}.", self.vault_path.display());
        if std::env::var(VAULT_PASSPHRASE_ENV).is_err() {
            println!("Export {VAULT_PASSPHRASE_ENV} so gemchat can unlock it.");
        }
        Ok(())
    }

    fn store(&self, passphrase: &str, key: &str) -> Result<()> {
        if let Some(parent) = self.vault_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        try_vault_set(&self.vault_path, passphrase, &self.vault_key, key)
            .context("failed to store key in vault")
    }
}

fn prompt_key() -> Result<String> {
    let key = Password::new()
        .with_prompt("Gemini API key")
        .interact()
        .context("failed to read API key")?;
    let key = key.trim().to_string();
    if key.is_empty() {
        bail!("API key cannot be empty");
    }
    Ok(key)
}
