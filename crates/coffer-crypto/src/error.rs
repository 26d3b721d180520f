use std::panic::Location;
use std::path::PathBuf;

use coffer_types::WrappingKeyId;
use thiserror::Error;

/// Errors from key material, key wrapping, and cipher setup.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The key was destroyed; its bytes are gone.
    #[error("key material was destroyed at {destroyed_at}")]
    Destroyed {
        destroyed_at: &'static Location<'static>,
    },

    #[error("invalid key length: expected {expected} bytes, found {found}")]
    InvalidKeyLength { expected: String, found: usize },

    #[error("invalid IV length: expected {expected} bytes, found {found}")]
    InvalidIvLength { expected: usize, found: usize },

    #[error("unsupported content key size: {0} bits (expected 128, 192 or 256)")]
    UnsupportedKeySize(u32),

    #[error("unsupported key wrapping algorithm: {0}")]
    UnsupportedWrapAlgorithm(String),

    /// The wrapper does not hold the key-encryption key a row names.
    #[error("wrapping key {0} is not configured for decryption")]
    UnknownWrappingKey(WrappingKeyId),

    #[error("key wrapper is configured for decryption only")]
    EncryptionDisabled,

    /// AEAD authentication failed: wrong key, tampered row, or mismatched
    /// algorithm/key id binding.
    #[error("authentication failed unwrapping with {key_id}")]
    AuthFailed { key_id: WrappingKeyId },

    #[error("malformed wrapped key for {key_id}: {reason}")]
    MalformedWrappedKey {
        key_id: WrappingKeyId,
        reason: &'static str,
    },

    #[error("random number generator failure: {0}")]
    Rng(String),
}

/// Errors from persisting or loading stored data encryption keys.
#[derive(Debug, Error)]
pub enum AccessorError {
    #[error("key store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed key document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed hex in {field} of {path}: {source}")]
    Hex {
        path: PathBuf,
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Result alias for key and cipher operations.
pub type CryptoResult<T> = Result<T, KeyError>;

/// Result alias for key accessor operations.
pub type AccessorResult<T> = Result<T, AccessorError>;
