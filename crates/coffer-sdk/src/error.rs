use std::io;
use std::path::PathBuf;

use coffer_crypto::{AccessorError, KeyError};
use coffer_store::{ReadError, WriteError};
use coffer_types::RangeError;
use coffer_vault::VaultError;
use thiserror::Error;

/// Problems with a configuration file or value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("unsupported content key size {0} (expected 128, 192 or 256)")]
    UnsupportedKeyBits(u32),

    #[error("wrapping key ids must not be empty")]
    EmptyKeyId,

    #[error("wrapping key {0:?} is configured twice")]
    DuplicateKeyId(String),

    #[error("invalid secret for wrapping key {id:?}: {reason}")]
    InvalidSecret { id: String, reason: String },

    #[error("encryption is enabled but no wrapping key may encrypt")]
    NoEncryptingKey,

    #[error("encryption over a filesystem store needs a persistent key_store")]
    MissingKeyStore,
}

#[derive(Debug, Error)]
pub enum SdkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("key store error: {0}")]
    Accessor(#[from] AccessorError),

    #[error("failed to open content root {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stream copy failed: {0}")]
    Stream(#[source] io::Error),

    #[error("encryption is not enabled for this store")]
    EncryptionDisabled,
}

pub type SdkResult<T> = Result<T, SdkError>;
