//! Foundation types for Coffer.
//!
//! This crate provides the identity and range types shared by every other
//! Coffer crate. It has no knowledge of storage or cryptography.
//!
//! # Key Types
//!
//! - [`ContentReference`] -- Opaque, immutable handle to one stored object
//! - [`ContentRangeRequest`] -- Client-specified byte range before resolution
//! - [`ResolvedContentRange`] -- Byte range anchored to a known content size
//! - [`WrappingKeyId`] -- Identity of a key-encryption key
//! - [`AlgorithmId`] -- Name of a content-encryption algorithm

pub mod error;
pub mod ids;
pub mod range;
pub mod reference;

pub use error::{RangeError, TypeError};
pub use ids::{AlgorithmId, WrappingKeyId};
pub use range::{ContentRangeHeader, ContentRangeRequest, ResolvedContentRange};
pub use reference::ContentReference;
