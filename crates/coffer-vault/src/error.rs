use coffer_store::{ReadError, WriteError};
use coffer_types::{ContentReference, WrappingKeyId};
use thiserror::Error;

/// Errors from key maintenance on encrypted content.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Write(#[from] WriteError),

    /// The content has no key rows; it is stored in the clear.
    #[error("content {0} is not encrypted")]
    NotEncrypted(ContentReference),

    /// Revoking the row would leave the content undecryptable.
    #[error("refusing to revoke {wrapping_key_id} from {reference}: no other row can be decrypted")]
    LastDecryptableKey {
        reference: ContentReference,
        wrapping_key_id: WrappingKeyId,
    },
}

/// Result alias for key maintenance operations.
pub type VaultResult<T> = Result<T, VaultError>;
