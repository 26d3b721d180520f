use std::fmt;

use coffer_types::{AlgorithmId, WrappingKeyId};

use crate::error::CryptoResult;
use crate::keys::KeyBytes;

/// A data encryption key as persisted: wrapped by one key-encryption key.
///
/// A row whose wrapping key id is the unwrapped sentinel holds the data
/// encryption key in the clear. Rows are never mutated after creation.
pub struct StoredDataEncryptionKey {
    algorithm: AlgorithmId,
    wrapping_key_id: WrappingKeyId,
    wrapped_key: KeyBytes,
    iv: Vec<u8>,
}

impl StoredDataEncryptionKey {
    pub fn new(
        algorithm: AlgorithmId,
        wrapping_key_id: WrappingKeyId,
        wrapped_key: KeyBytes,
        iv: Vec<u8>,
    ) -> Self {
        Self {
            algorithm,
            wrapping_key_id,
            wrapped_key,
            iv,
        }
    }

    /// Content-encryption algorithm the key belongs to.
    pub fn algorithm(&self) -> &AlgorithmId {
        &self.algorithm
    }

    pub fn wrapping_key_id(&self) -> &WrappingKeyId {
        &self.wrapping_key_id
    }

    pub fn is_unwrapped(&self) -> bool {
        self.wrapping_key_id.is_unwrapped()
    }

    pub fn wrapped_key(&self) -> CryptoResult<&[u8]> {
        self.wrapped_key.expose()
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn is_destroyed(&self) -> bool {
        self.wrapped_key.is_destroyed()
    }

    pub fn duplicate(&self) -> CryptoResult<Self> {
        Ok(Self {
            algorithm: self.algorithm.clone(),
            wrapping_key_id: self.wrapping_key_id.clone(),
            wrapped_key: self.wrapped_key.duplicate()?,
            iv: self.iv.clone(),
        })
    }

    #[track_caller]
    pub fn destroy(&mut self) {
        self.wrapped_key.destroy();
    }
}

impl fmt::Debug for StoredDataEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredDataEncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("wrapping_key_id", &self.wrapping_key_id)
            .field("wrapped_key", &self.wrapped_key)
            .finish_non_exhaustive()
    }
}

/// An unwrapped, usable data encryption key.
pub struct EncryptionParameters {
    algorithm: AlgorithmId,
    key: KeyBytes,
    iv: Vec<u8>,
}

impl EncryptionParameters {
    pub fn new(algorithm: AlgorithmId, key: KeyBytes, iv: Vec<u8>) -> Self {
        Self { algorithm, key, iv }
    }

    pub fn algorithm(&self) -> &AlgorithmId {
        &self.algorithm
    }

    pub fn key(&self) -> &KeyBytes {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn is_destroyed(&self) -> bool {
        self.key.is_destroyed()
    }

    #[track_caller]
    pub fn destroy(&mut self) {
        self.key.destroy();
    }
}

impl fmt::Debug for EncryptionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionParameters")
            .field("algorithm", &self.algorithm)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_row_refuses_access() {
        let mut row = StoredDataEncryptionKey::new(
            AlgorithmId::new("aes-ctr"),
            WrappingKeyId::unwrapped(),
            KeyBytes::from_slice(&[1; 16]),
            vec![0; 16],
        );
        assert!(row.is_unwrapped());
        let dup = row.duplicate().unwrap();
        row.destroy();
        assert!(row.wrapped_key().is_err());
        assert!(row.duplicate().is_err());
        assert_eq!(dup.wrapped_key().unwrap(), &[1; 16]);
    }

    #[test]
    fn debug_hides_key_material() {
        let params = EncryptionParameters::new(
            AlgorithmId::new("aes-ctr"),
            KeyBytes::from_slice(&[0x5A; 16]),
            vec![0x11; 16],
        );
        let dbg = format!("{params:?}");
        assert!(dbg.contains("aes-ctr"));
        assert!(!dbg.contains("90"));
    }
}
