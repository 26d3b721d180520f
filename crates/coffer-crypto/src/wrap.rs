//! Wrapping of data encryption keys by key-encryption keys (KEKs).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::XChaCha20Poly1305;
use coffer_types::WrappingKeyId;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::dek::{EncryptionParameters, StoredDataEncryptionKey};
use crate::error::{CryptoResult, KeyError};
use crate::keys::KeyBytes;

/// Turns usable keys into persistable rows and back.
pub trait DataEncryptionKeyWrapper: Send + Sync {
    /// Whether [`wrap`](Self::wrap) may be called.
    fn can_encrypt(&self) -> bool;

    /// Whether [`unwrap`](Self::unwrap) may be called.
    fn can_decrypt(&self) -> bool;

    /// Wrapping key ids this wrapper can unwrap.
    fn supported_key_ids(&self) -> Vec<WrappingKeyId>;

    fn wrap(&self, params: &EncryptionParameters) -> CryptoResult<StoredDataEncryptionKey>;

    fn unwrap(&self, stored: &StoredDataEncryptionKey) -> CryptoResult<EncryptionParameters>;
}

// ---------------------------------------------------------------------------
// UnencryptedKeyWrapper
// ---------------------------------------------------------------------------

/// Stores data encryption keys in the clear under the unwrapped sentinel id.
#[derive(Debug, Clone, Copy)]
pub struct UnencryptedKeyWrapper {
    encrypt: bool,
}

impl UnencryptedKeyWrapper {
    pub fn new() -> Self {
        Self { encrypt: true }
    }

    /// Reads existing clear-text rows but never writes new ones.
    pub fn decrypt_only() -> Self {
        Self { encrypt: false }
    }
}

impl Default for UnencryptedKeyWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl DataEncryptionKeyWrapper for UnencryptedKeyWrapper {
    fn can_encrypt(&self) -> bool {
        self.encrypt
    }

    fn can_decrypt(&self) -> bool {
        true
    }

    fn supported_key_ids(&self) -> Vec<WrappingKeyId> {
        vec![WrappingKeyId::unwrapped()]
    }

    fn wrap(&self, params: &EncryptionParameters) -> CryptoResult<StoredDataEncryptionKey> {
        if !self.encrypt {
            return Err(KeyError::EncryptionDisabled);
        }
        Ok(StoredDataEncryptionKey::new(
            params.algorithm().clone(),
            WrappingKeyId::unwrapped(),
            params.key().duplicate()?,
            params.iv().to_vec(),
        ))
    }

    fn unwrap(&self, stored: &StoredDataEncryptionKey) -> CryptoResult<EncryptionParameters> {
        if !stored.is_unwrapped() {
            return Err(KeyError::UnknownWrappingKey(stored.wrapping_key_id().clone()));
        }
        Ok(EncryptionParameters::new(
            stored.algorithm().clone(),
            KeyBytes::from_slice(stored.wrapped_key()?),
            stored.iv().to_vec(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Key-encryption keys
// ---------------------------------------------------------------------------

/// AEAD algorithm used to wrap data encryption keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WrapAlgorithm {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl WrapAlgorithm {
    pub const KEY_LEN: usize = 32;
    const TAG_LEN: usize = 16;

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            Self::Aes256Gcm => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }

    fn seal(&self, key: &[u8], nonce: &[u8], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
        match self {
            Self::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .ok()?
                .encrypt(nonce.into(), payload)
                .ok(),
            Self::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
                .ok()?
                .encrypt(nonce.into(), payload)
                .ok(),
        }
    }

    fn open(&self, key: &[u8], nonce: &[u8], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
        match self {
            Self::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .ok()?
                .decrypt(nonce.into(), payload)
                .ok(),
            Self::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
                .ok()?
                .decrypt(nonce.into(), payload)
                .ok(),
        }
    }
}

impl fmt::Display for WrapAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WrapAlgorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "xchacha20-poly1305" => Ok(Self::XChaCha20Poly1305),
            _ => Err(KeyError::UnsupportedWrapAlgorithm(s.to_string())),
        }
    }
}

/// A named key-encryption key.
#[derive(Debug)]
pub struct KeyEncryptionKey {
    id: WrappingKeyId,
    algorithm: WrapAlgorithm,
    secret: KeyBytes,
}

impl KeyEncryptionKey {
    pub fn new(id: WrappingKeyId, algorithm: WrapAlgorithm, secret: KeyBytes) -> CryptoResult<Self> {
        if secret.len() != WrapAlgorithm::KEY_LEN {
            return Err(KeyError::InvalidKeyLength {
                expected: WrapAlgorithm::KEY_LEN.to_string(),
                found: secret.len(),
            });
        }
        Ok(Self {
            id,
            algorithm,
            secret,
        })
    }

    /// A fresh random key.
    pub fn generate(id: WrappingKeyId, algorithm: WrapAlgorithm) -> CryptoResult<Self> {
        Self::new(id, algorithm, KeyBytes::random(WrapAlgorithm::KEY_LEN)?)
    }

    pub fn id(&self) -> &WrappingKeyId {
        &self.id
    }

    pub fn algorithm(&self) -> WrapAlgorithm {
        self.algorithm
    }
}

// ---------------------------------------------------------------------------
// AeadKeyWrapper
// ---------------------------------------------------------------------------

const AAD_DOMAIN: &[u8] = b"coffer-dek-wrap-v1";

/// Binds a wrapped key to the content algorithm and to the KEK that wrapped
/// it, so a row cannot be replayed under another id or algorithm.
fn associated_data(algorithm: &str, kek: &KeyEncryptionKey) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_DOMAIN.len() + algorithm.len() + kek.id.as_str().len() + 2);
    aad.extend_from_slice(AAD_DOMAIN);
    aad.push(0);
    aad.extend_from_slice(algorithm.as_bytes());
    aad.push(0);
    aad.extend_from_slice(kek.id.as_str().as_bytes());
    aad
}

/// Wraps data encryption keys with AEAD under named KEKs.
///
/// New rows are wrapped with the primary KEK. Rows can be unwrapped with any
/// configured KEK, so rotating keys means configuring the new KEK as primary
/// and keeping the old one for decryption. The wrapped form is
/// `nonce || ciphertext || tag`.
#[derive(Debug, Clone)]
pub struct AeadKeyWrapper {
    primary: Option<Arc<KeyEncryptionKey>>,
    decryption_keys: Vec<Arc<KeyEncryptionKey>>,
}

impl AeadKeyWrapper {
    /// Encrypt and decrypt with `kek`.
    pub fn new(kek: KeyEncryptionKey) -> Self {
        let kek = Arc::new(kek);
        Self {
            primary: Some(Arc::clone(&kek)),
            decryption_keys: vec![kek],
        }
    }

    /// Wrap new rows with `kek` but never unwrap.
    pub fn encrypt_only(kek: KeyEncryptionKey) -> Self {
        Self {
            primary: Some(Arc::new(kek)),
            decryption_keys: Vec::new(),
        }
    }

    /// Unwrap rows made by any of `keks`; never wrap.
    pub fn decrypt_only(keks: impl IntoIterator<Item = KeyEncryptionKey>) -> Self {
        Self {
            primary: None,
            decryption_keys: keks.into_iter().map(Arc::new).collect(),
        }
    }

    /// Also accept rows wrapped by `kek`.
    pub fn with_decryption_key(mut self, kek: KeyEncryptionKey) -> Self {
        self.decryption_keys.push(Arc::new(kek));
        self
    }

    /// Id of the KEK new rows are wrapped with.
    pub fn primary_key_id(&self) -> Option<&WrappingKeyId> {
        self.primary.as_ref().map(|kek| &kek.id)
    }
}

impl DataEncryptionKeyWrapper for AeadKeyWrapper {
    fn can_encrypt(&self) -> bool {
        self.primary.is_some()
    }

    fn can_decrypt(&self) -> bool {
        !self.decryption_keys.is_empty()
    }

    fn supported_key_ids(&self) -> Vec<WrappingKeyId> {
        self.decryption_keys.iter().map(|k| k.id.clone()).collect()
    }

    fn wrap(&self, params: &EncryptionParameters) -> CryptoResult<StoredDataEncryptionKey> {
        let kek = self.primary.as_ref().ok_or(KeyError::EncryptionDisabled)?;
        let algorithm = kek.algorithm;

        let mut nonce = vec![0u8; algorithm.nonce_len()];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| KeyError::Rng(e.to_string()))?;

        let aad = associated_data(params.algorithm().as_str(), kek);
        let sealed = algorithm
            .seal(
                kek.secret.expose()?,
                &nonce,
                Payload {
                    msg: params.key().expose()?,
                    aad: &aad,
                },
            )
            .ok_or(KeyError::AuthFailed {
                key_id: kek.id.clone(),
            })?;

        let mut wrapped = nonce;
        wrapped.extend_from_slice(&sealed);
        debug!(kek = %kek.id, algorithm = %algorithm, "wrapped data encryption key");
        Ok(StoredDataEncryptionKey::new(
            params.algorithm().clone(),
            kek.id.clone(),
            KeyBytes::new(wrapped),
            params.iv().to_vec(),
        ))
    }

    fn unwrap(&self, stored: &StoredDataEncryptionKey) -> CryptoResult<EncryptionParameters> {
        let key_id = stored.wrapping_key_id();
        let kek = self
            .decryption_keys
            .iter()
            .find(|k| &k.id == key_id)
            .ok_or_else(|| KeyError::UnknownWrappingKey(key_id.clone()))?;
        let algorithm = kek.algorithm;

        let wrapped = stored.wrapped_key()?;
        if wrapped.len() < algorithm.nonce_len() + WrapAlgorithm::TAG_LEN {
            return Err(KeyError::MalformedWrappedKey {
                key_id: key_id.clone(),
                reason: "shorter than nonce and tag",
            });
        }
        let (nonce, ciphertext) = wrapped.split_at(algorithm.nonce_len());

        let aad = associated_data(stored.algorithm().as_str(), kek);
        let plain = algorithm
            .open(
                kek.secret.expose()?,
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map(Zeroizing::new)
            .ok_or_else(|| KeyError::AuthFailed {
                key_id: key_id.clone(),
            })?;

        Ok(EncryptionParameters::new(
            stored.algorithm().clone(),
            KeyBytes::from_slice(&plain),
            stored.iv().to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_types::AlgorithmId;

    fn params() -> EncryptionParameters {
        EncryptionParameters::new(
            AlgorithmId::new("aes-ctr"),
            KeyBytes::from_slice(&[0x42; 32]),
            vec![0x07; 16],
        )
    }

    fn kek(id: &str, algorithm: WrapAlgorithm) -> KeyEncryptionKey {
        KeyEncryptionKey::generate(WrappingKeyId::new(id), algorithm).unwrap()
    }

    // ----------------------------------------------------------------
    // Unencrypted wrapper
    // ----------------------------------------------------------------

    #[test]
    fn unencrypted_wrapper_stores_clear_key() {
        let wrapper = UnencryptedKeyWrapper::new();
        let row = wrapper.wrap(&params()).unwrap();
        assert!(row.is_unwrapped());
        assert_eq!(row.wrapped_key().unwrap(), &[0x42; 32]);

        let back = wrapper.unwrap(&row).unwrap();
        assert_eq!(back.key().expose().unwrap(), &[0x42; 32]);
        assert_eq!(back.iv(), &[0x07; 16]);
    }

    #[test]
    fn unencrypted_wrapper_rejects_wrapped_rows() {
        let wrapper = UnencryptedKeyWrapper::new();
        let row = AeadKeyWrapper::new(kek("k1", WrapAlgorithm::Aes256Gcm))
            .wrap(&params())
            .unwrap();
        assert!(matches!(
            wrapper.unwrap(&row),
            Err(KeyError::UnknownWrappingKey(_))
        ));
    }

    #[test]
    fn decrypt_only_unencrypted_wrapper_refuses_wrap() {
        let wrapper = UnencryptedKeyWrapper::decrypt_only();
        assert!(!wrapper.can_encrypt());
        assert!(matches!(
            wrapper.wrap(&params()),
            Err(KeyError::EncryptionDisabled)
        ));
    }

    // ----------------------------------------------------------------
    // AEAD wrapper
    // ----------------------------------------------------------------

    #[test]
    fn aead_wrap_unwrap_both_algorithms() {
        for algorithm in [WrapAlgorithm::Aes256Gcm, WrapAlgorithm::XChaCha20Poly1305] {
            let wrapper = AeadKeyWrapper::new(kek("kek-a", algorithm));
            let row = wrapper.wrap(&params()).unwrap();
            assert_eq!(row.wrapping_key_id().as_str(), "kek-a");
            assert_eq!(
                row.wrapped_key().unwrap().len(),
                algorithm.nonce_len() + 32 + 16
            );
            assert_ne!(&row.wrapped_key().unwrap()[algorithm.nonce_len()..][..32], &[0x42; 32]);

            let back = wrapper.unwrap(&row).unwrap();
            assert_eq!(back.key().expose().unwrap(), &[0x42; 32]);
            assert_eq!(back.algorithm().as_str(), "aes-ctr");
        }
    }

    #[test]
    fn rotated_wrapper_reads_old_rows() {
        let old_secret = KeyBytes::random(32).unwrap();
        let old = KeyEncryptionKey::new(
            WrappingKeyId::new("old"),
            WrapAlgorithm::Aes256Gcm,
            old_secret.duplicate().unwrap(),
        )
        .unwrap();
        let row = AeadKeyWrapper::new(old).wrap(&params()).unwrap();

        let rotated = AeadKeyWrapper::new(kek("new", WrapAlgorithm::XChaCha20Poly1305))
            .with_decryption_key(
                KeyEncryptionKey::new(WrappingKeyId::new("old"), WrapAlgorithm::Aes256Gcm, old_secret)
                    .unwrap(),
            );
        assert_eq!(rotated.primary_key_id().unwrap().as_str(), "new");
        assert_eq!(rotated.supported_key_ids().len(), 2);
        assert!(rotated.unwrap(&row).is_ok());
    }

    #[test]
    fn tampered_row_fails_authentication() {
        let wrapper = AeadKeyWrapper::new(kek("k", WrapAlgorithm::Aes256Gcm));
        let row = wrapper.wrap(&params()).unwrap();
        let mut bytes = row.wrapped_key().unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        let tampered = StoredDataEncryptionKey::new(
            row.algorithm().clone(),
            row.wrapping_key_id().clone(),
            KeyBytes::new(bytes),
            row.iv().to_vec(),
        );
        assert!(matches!(
            wrapper.unwrap(&tampered),
            Err(KeyError::AuthFailed { .. })
        ));
    }

    #[test]
    fn algorithm_id_is_bound() {
        let wrapper = AeadKeyWrapper::new(kek("k", WrapAlgorithm::XChaCha20Poly1305));
        let row = wrapper.wrap(&params()).unwrap();
        let relabeled = StoredDataEncryptionKey::new(
            AlgorithmId::new("other"),
            row.wrapping_key_id().clone(),
            KeyBytes::from_slice(row.wrapped_key().unwrap()),
            row.iv().to_vec(),
        );
        assert!(matches!(
            wrapper.unwrap(&relabeled),
            Err(KeyError::AuthFailed { .. })
        ));
    }

    #[test]
    fn short_row_is_malformed() {
        let wrapper = AeadKeyWrapper::new(kek("k", WrapAlgorithm::Aes256Gcm));
        let row = StoredDataEncryptionKey::new(
            AlgorithmId::new("aes-ctr"),
            WrappingKeyId::new("k"),
            KeyBytes::from_slice(&[0; 10]),
            vec![0; 16],
        );
        assert!(matches!(
            wrapper.unwrap(&row),
            Err(KeyError::MalformedWrappedKey { .. })
        ));
    }

    #[test]
    fn decrypt_only_and_encrypt_only_capabilities() {
        let d = AeadKeyWrapper::decrypt_only([kek("a", WrapAlgorithm::Aes256Gcm)]);
        assert!(!d.can_encrypt());
        assert!(d.can_decrypt());
        assert!(matches!(d.wrap(&params()), Err(KeyError::EncryptionDisabled)));

        let e = AeadKeyWrapper::encrypt_only(kek("b", WrapAlgorithm::Aes256Gcm));
        assert!(e.can_encrypt());
        assert!(!e.can_decrypt());
        assert!(e.supported_key_ids().is_empty());
    }

    #[test]
    fn kek_length_is_checked() {
        let err = KeyEncryptionKey::new(
            WrappingKeyId::new("short"),
            WrapAlgorithm::Aes256Gcm,
            KeyBytes::from_slice(&[0; 16]),
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::InvalidKeyLength { found: 16, .. }));
    }

    #[test]
    fn wrap_algorithm_parses_names() {
        assert_eq!(
            "AES-256-GCM".parse::<WrapAlgorithm>().unwrap(),
            WrapAlgorithm::Aes256Gcm
        );
        assert_eq!(
            "xchacha20-poly1305".parse::<WrapAlgorithm>().unwrap(),
            WrapAlgorithm::XChaCha20Poly1305
        );
        assert!("rot13".parse::<WrapAlgorithm>().is_err());
    }
}
