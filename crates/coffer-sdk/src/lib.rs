//! Embedding entry point for Coffer.
//!
//! Reads a [`CofferConfig`] (TOML) and assembles the content store it
//! describes: a filesystem or in-memory backend, optionally behind the
//! encrypting decorator with its key store and wrapping keys.
//!
//! ```no_run
//! use coffer_sdk::{Coffer, CofferConfig, ContentRangeRequest};
//!
//! let config = CofferConfig::load("coffer.toml")?;
//! let coffer = Coffer::open(&config)?;
//! let stored = coffer.put_bytes(b"Test data")?;
//! let part = coffer.read_bytes(&stored.reference, &"bytes=5-7".parse()?)?;
//! assert_eq!(part, b"dat");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod coffer;
pub mod config;
pub mod error;

pub use coffer::{open_store, Coffer, StoredContent};
pub use config::{BackendKind, CofferConfig, EncryptionConfig, StoreConfig, WrappingKeyConfig};
pub use error::{ConfigError, SdkError, SdkResult};

// Re-export key types
pub use coffer_crypto::WrapAlgorithm;
pub use coffer_store::ContentStore;
pub use coffer_types::{
    ContentRangeRequest, ContentReference, ResolvedContentRange, WrappingKeyId,
};
pub use coffer_vault::KeyInfo;
