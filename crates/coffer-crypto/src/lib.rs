//! Key material and content encryption for Coffer.
//!
//! - [`KeyBytes`] -- secret bytes with tracked, explicit destruction
//! - [`StoredDataEncryptionKey`] / [`EncryptionParameters`] -- a data
//!   encryption key as persisted (wrapped) and as used (unwrapped)
//! - [`DataEncryptionKeyWrapper`] -- [`UnencryptedKeyWrapper`] and
//!   [`AeadKeyWrapper`] (AES-256-GCM or XChaCha20-Poly1305 KEKs)
//! - [`DataEncryptionKeyAccessor`] -- [`InMemoryKeyAccessor`] and
//!   [`FileKeyAccessor`]
//! - [`ContentEncryptionEngine`] -- [`AesCtrEngine`], seekable AES-CTR
//!
//! All crypto operations wrap established libraries -- no custom cryptography.

pub mod accessor;
pub mod dek;
pub mod engine;
pub mod error;
pub mod keys;
pub mod wrap;

pub use accessor::{DataEncryptionKeyAccessor, FileKeyAccessor, InMemoryKeyAccessor};
pub use dek::{EncryptionParameters, StoredDataEncryptionKey};
pub use engine::{adjust_iv, AesCtrEngine, CiphertextFetch, ContentEncryptionEngine, AES_CTR};
pub use error::{AccessorError, AccessorResult, CryptoResult, KeyError};
pub use keys::{KeyBytes, KeyCopy};
pub use wrap::{
    AeadKeyWrapper, DataEncryptionKeyWrapper, KeyEncryptionKey, UnencryptedKeyWrapper,
    WrapAlgorithm,
};
