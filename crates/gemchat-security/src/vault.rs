use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable holding the vault passphrase.
pub const VAULT_PASSPHRASE_ENV: &str = "GEMCHAT_VAULT_PASSPHRASE";

const PBKDF2_ITERATIONS: u32 = 600_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("vault io error: {0}")]
    Io(String),
    #[error("vault format error: {0}")]
    Format(String),
    #[error("vault crypto error: {0}")]
    Crypto(String),
    #[error("wrong vault passphrase")]
    WrongPassphrase,
}

#[derive(Serialize, Deserialize)]
struct SealedVault {
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// API keys sealed with AES-256-GCM under a PBKDF2-derived key.
///
/// A fresh nonce is drawn on every [`CredentialVault::save`]; the salt is
/// fixed for the lifetime of the file.
pub struct CredentialVault {
    path: PathBuf,
    salt: Vec<u8>,
    key: [u8; KEY_LEN],
    entries: BTreeMap<String, String>,
}

impl CredentialVault {
    /// Open the vault at `path`, or start an empty one if the file is absent.
    pub fn open_or_create(path: &Path, passphrase: &str) -> Result<Self, CredentialError> {
        if !path.is_file() {
            let mut salt = vec![0u8; SALT_LEN];
            SystemRandom::new()
                .fill(&mut salt)
                .map_err(|_| CredentialError::Crypto("salt generation failed".into()))?;
            let key = derive_key(passphrase, &salt);
            info!("starting new credential vault at {}", path.display());
            return Ok(Self {
                path: path.to_path_buf(),
                salt,
                key,
                entries: BTreeMap::new(),
            });
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| CredentialError::Io(format!("read {}: {e}", path.display())))?;
        let sealed: SealedVault = serde_json::from_str(&raw)
            .map_err(|e| CredentialError::Format(format!("bad vault file: {e}")))?;

        let salt = decode("salt", &sealed.salt)?;
        let nonce = decode("nonce", &sealed.nonce)?;
        let mut buffer = decode("ciphertext", &sealed.ciphertext)?;
        let key = derive_key(passphrase, &salt);

        let nonce = Nonce::try_assume_unique_for_key(&nonce)
            .map_err(|_| CredentialError::Format("bad nonce length".into()))?;
        let plaintext = aead_key(&key)?
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CredentialError::WrongPassphrase)?;
        let entries: BTreeMap<String, String> = serde_json::from_slice(plaintext)
            .map_err(|e| CredentialError::Format(format!("bad vault contents: {e}")))?;

        debug!("opened credential vault with {} entries", entries.len());
        Ok(Self {
            path: path.to_path_buf(),
            salt,
            key,
            entries,
        })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Seal and write the vault.
    pub fn save(&self) -> Result<(), CredentialError> {
        let mut buffer = serde_json::to_vec(&self.entries)
            .map_err(|e| CredentialError::Format(format!("serialize entries: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| CredentialError::Crypto("nonce generation failed".into()))?;
        aead_key(&self.key)?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| CredentialError::Crypto("encryption failed".into()))?;

        let sealed = SealedVault {
            salt: BASE64.encode(&self.salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(&buffer),
        };
        let json = serde_json::to_string_pretty(&sealed)
            .map_err(|e| CredentialError::Format(format!("serialize vault: {e}")))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CredentialError::Io(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::write(&self.path, json)
            .map_err(|e| CredentialError::Io(format!("write {}: {e}", self.path.display())))
    }
}

/// Read one entry, treating every failure as "not configured".
pub fn try_vault_get(path: &Path, passphrase: &str, name: &str) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    match CredentialVault::open_or_create(path, passphrase) {
        Ok(vault) => vault.get(name).map(str::to_string),
        Err(e) => {
            warn!("could not open credential vault: {e}");
            None
        }
    }
}

/// Store one entry, creating the vault if needed.
pub fn try_vault_set(
    path: &Path,
    passphrase: &str,
    name: &str,
    value: &str,
) -> Result<(), CredentialError> {
    let mut vault = CredentialVault::open_or_create(path, passphrase)?;
    vault.set(name, value);
    vault.save()?;
    info!("stored credential '{name}' in vault");
    Ok(())
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut key,
    );
    key
}

fn aead_key(key: &[u8; KEY_LEN]) -> Result<LessSafeKey, CredentialError> {
    UnboundKey::new(&AES_256_GCM, key)
        .map(LessSafeKey::new)
        .map_err(|_| CredentialError::Crypto("invalid key length".into()))
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>, CredentialError> {
    BASE64
        .decode(value)
        .map_err(|e| CredentialError::Format(format!("bad {field} encoding: {e}")))
}
