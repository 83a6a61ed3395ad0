use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::vault::{VAULT_PASSPHRASE_ENV, try_vault_get};

/// Resolves the provider API key at the moment a request is made.
///
/// Implementations must not cache: a key changed between two calls has to be
/// visible to the second one.
pub trait CredentialLookup: Send + Sync {
    fn lookup(&self) -> Option<String>;
}

impl<F> CredentialLookup for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn lookup(&self) -> Option<String> {
        self()
    }
}

/// First non-empty value among a list of environment variables.
pub struct EnvCredential {
    vars: Vec<String>,
}

impl EnvCredential {
    pub fn new<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(Into::into).collect(),
        }
    }
}

impl CredentialLookup for EnvCredential {
    fn lookup(&self) -> Option<String> {
        self.vars.iter().find_map(|var| {
            std::env::var(var)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    }
}

/// Entry in the encrypted vault. The passphrase comes from
/// `GEMCHAT_VAULT_PASSPHRASE` unless given explicitly.
pub struct VaultCredential {
    path: PathBuf,
    name: String,
    passphrase: Option<String>,
}

impl VaultCredential {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    fn passphrase(&self) -> Option<String> {
        self.passphrase.clone().or_else(|| {
            std::env::var(VAULT_PASSPHRASE_ENV)
                .ok()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
        })
    }
}

impl CredentialLookup for VaultCredential {
    fn lookup(&self) -> Option<String> {
        if !self.path.is_file() {
            return None;
        }
        let Some(passphrase) = self.passphrase() else {
            debug!("vault present but no passphrase set in {VAULT_PASSPHRASE_ENV}");
            return None;
        };
        try_vault_get(&self.path, &passphrase, &self.name)
    }
}

/// Fixed key, mostly for tests and one-off invocations.
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Some(key.into()))
    }

    pub fn missing() -> Self {
        Self(None)
    }
}

impl CredentialLookup for StaticCredential {
    fn lookup(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Try each source in order.
#[derive(Default)]
pub struct ChainedCredential {
    sources: Vec<Arc<dyn CredentialLookup>>,
}

impl ChainedCredential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn CredentialLookup>) -> Self {
        self.sources.push(source);
        self
    }
}

impl CredentialLookup for ChainedCredential {
    fn lookup(&self) -> Option<String> {
        self.sources.iter().find_map(|s| s.lookup())
    }
}
