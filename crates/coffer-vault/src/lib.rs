//! Transparent encryption at rest for Coffer content stores.
//!
//! [`EncryptedContentStore`] decorates any
//! [`ContentStore`](coffer_store::ContentStore). Writes go through a content
//! encryption engine with a fresh data encryption key per object; that key
//! is wrapped by every configured key-encryption key and persisted through a
//! [`DataEncryptionKeyAccessor`](coffer_crypto::DataEncryptionKeyAccessor).
//! Reads unwrap the first usable row and decrypt only the ciphertext
//! covering the requested range.
//!
//! Objects with no key rows are read as plaintext.

pub mod error;
pub mod store;

pub use error::{VaultError, VaultResult};
pub use store::{EncryptedContentStore, KeyInfo};
