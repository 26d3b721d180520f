use std::io;

use coffer_types::{AlgorithmId, ContentReference, RangeError, WrappingKeyId};

/// Boxed error used where the cause comes from another subsystem
/// (key unwrapping, key persistence) that this crate does not know about.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Contract violations by the caller: reusing a single-use stream or asking
/// a writer for results before it has been closed.
///
/// These are programmer errors, not data errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("content stream for {0} has already been taken")]
    StreamAlreadyTaken(ContentReference),

    #[error("content sink of {description} has already been opened")]
    SinkAlreadyOpened { description: String },

    #[error("{description} has not been closed; its reference and size are not available yet")]
    NotClosed { description: String },
}

/// Content could not be read.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The requested range does not fit the content.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// No content is stored under the reference.
    #[error("content {0} not found")]
    NotFound(ContentReference),

    /// The backend's stored size disagrees with the size the caller resolved
    /// the range against (stale or corrupted metadata).
    #[error("content {reference} holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        reference: ContentReference,
        expected: u64,
        actual: u64,
    },

    /// The backend failed while opening or reading the content.
    #[error("I/O error reading {reference}: {source}")]
    Io {
        reference: ContentReference,
        #[source]
        source: io::Error,
    },

    /// Stored encryption keys could not be looked up.
    #[error("key lookup for {reference} failed: {source}")]
    KeyLookup {
        reference: ContentReference,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Undecryptable(#[from] UndecryptableError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ReadError {
    pub fn io(reference: &ContentReference, source: io::Error) -> Self {
        Self::Io {
            reference: reference.clone(),
            source,
        }
    }

    /// The reference this error concerns, where one exists.
    pub fn reference(&self) -> Option<&ContentReference> {
        match self {
            Self::Range(_) => None,
            Self::NotFound(reference)
            | Self::SizeMismatch { reference, .. }
            | Self::Io { reference, .. }
            | Self::KeyLookup { reference, .. } => Some(reference),
            Self::Undecryptable(e) => Some(e.reference()),
            Self::State(StateError::StreamAlreadyTaken(reference)) => Some(reference),
            Self::State(_) => None,
        }
    }
}

/// Encrypted content exists but cannot be decrypted.
#[derive(Debug, thiserror::Error)]
pub enum UndecryptableError {
    /// None of the stored keys is wrapped by a key any configured wrapper can use.
    #[error("no decryptable keys for {reference}: stored {stored:?}, supported {supported:?}")]
    NoDecryptableKeys {
        reference: ContentReference,
        stored: Vec<WrappingKeyId>,
        supported: Vec<WrappingKeyId>,
    },

    /// Keys matched a wrapper but no engine implements their algorithm.
    #[error("unsupported decryption algorithm for {reference}: {algorithms:?}")]
    UnsupportedAlgorithm {
        reference: ContentReference,
        algorithms: Vec<AlgorithmId>,
    },

    /// Every unwrap attempt failed. The first failure is the source, the
    /// rest are kept as suppressed causes.
    #[error("unable to unwrap any key for {reference}: {source}")]
    UnwrapFailed {
        reference: ContentReference,
        #[source]
        source: BoxError,
        suppressed: Vec<BoxError>,
    },

    /// The cipher could not be initialised with the unwrapped key.
    #[error("cipher setup failed for {reference}: {reason}")]
    Cipher {
        reference: ContentReference,
        reason: String,
    },
}

impl UndecryptableError {
    pub fn reference(&self) -> &ContentReference {
        match self {
            Self::NoDecryptableKeys { reference, .. }
            | Self::UnsupportedAlgorithm { reference, .. }
            | Self::UnwrapFailed { reference, .. }
            | Self::Cipher { reference, .. } => reference,
        }
    }
}

/// Content could not be written or removed.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The backend failed. The reference is absent when the failure happened
    /// before the backend assigned one.
    #[error("I/O error writing {}: {source}", display_reference(.reference))]
    Io {
        reference: Option<ContentReference>,
        #[source]
        source: io::Error,
    },

    /// Wrapped keys could not be persisted or cleared.
    #[error("key persistence for {reference} failed: {source}")]
    KeyPersistence {
        reference: ContentReference,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Unencryptable(#[from] UnencryptableError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl WriteError {
    pub fn io(reference: Option<&ContentReference>, source: io::Error) -> Self {
        Self::Io {
            reference: reference.cloned(),
            source,
        }
    }
}

/// Content cannot be encrypted. Always raised before any ciphertext
/// reaches the backend.
#[derive(Debug, thiserror::Error)]
pub enum UnencryptableError {
    #[error("no content encryption engine is configured")]
    NoEncryptionEngine,

    #[error("none of the {wrappers} configured key wrappers can encrypt")]
    NoEncryptableKeys { wrappers: usize },

    #[error("wrapping the data encryption key failed: {0}")]
    WrapFailed(#[source] BoxError),

    #[error("cipher setup failed: {0}")]
    Cipher(String),
}

fn display_reference(reference: &Option<ContentReference>) -> String {
    match reference {
        Some(r) => r.to_string(),
        None => "<unassigned>".to_string(),
    }
}

/// Result alias for read operations.
pub type ReadResult<T> = Result<T, ReadError>;

/// Result alias for write and remove operations.
pub type WriteResult<T> = Result<T, WriteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_errors_carry_reference() {
        let r = ContentReference::parse("abc").unwrap();
        assert_eq!(ReadError::NotFound(r.clone()).reference(), Some(&r));
        let e = ReadError::from(UndecryptableError::NoDecryptableKeys {
            reference: r.clone(),
            stored: vec![WrappingKeyId::new("a")],
            supported: vec![],
        });
        assert_eq!(e.reference(), Some(&r));
        assert!(ReadError::from(RangeError::Inverted { start: 2, end: 1 })
            .reference()
            .is_none());
    }

    #[test]
    fn write_error_without_reference_displays_placeholder() {
        let e = WriteError::io(None, io::Error::other("disk full"));
        assert!(e.to_string().contains("<unassigned>"));
    }

    #[test]
    fn undecryptable_message_lists_ids() {
        let e = UndecryptableError::NoDecryptableKeys {
            reference: ContentReference::parse("abc").unwrap(),
            stored: vec![WrappingKeyId::new("old")],
            supported: vec![WrappingKeyId::new("new")],
        };
        let msg = e.to_string();
        assert!(msg.contains("old"));
        assert!(msg.contains("new"));
    }
}
