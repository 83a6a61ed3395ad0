pub mod credentials;
pub mod redaction;
pub mod vault;

pub use credentials::{
    ChainedCredential, CredentialLookup, EnvCredential, StaticCredential, VaultCredential,
};
pub use redaction::{RedactingWriter, redact_secrets};
pub use vault::{
    CredentialError, CredentialVault, VAULT_PASSPHRASE_ENV, try_vault_get, try_vault_set,
};
