use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use coffer_crypto::{
    AeadKeyWrapper, DataEncryptionKeyWrapper, KeyBytes, KeyEncryptionKey, UnencryptedKeyWrapper,
    WrapAlgorithm,
};
use coffer_types::WrappingKeyId;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroize;

use crate::error::ConfigError;

/// Top-level configuration, usually read from `coffer.toml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CofferConfig {
    pub store: StoreConfig,
    pub encryption: EncryptionConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Filesystem,
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Content directory. Ignored by the memory backend.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Filesystem,
            root: PathBuf::from("./coffer-data"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// AES key size for new content.
    pub key_bits: u32,
    /// Directory of the JSON key store. `None` keeps key rows in memory.
    pub key_store: Option<PathBuf>,
    /// Also persist a clear-text row of every content key.
    pub store_unwrapped: bool,
    pub wrapping_keys: Vec<WrappingKeyConfig>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_bits: 256,
            key_store: None,
            store_unwrapped: false,
            wrapping_keys: Vec::new(),
        }
    }
}

/// One key-encryption key. The secret is 32 bytes, hex-encoded.
#[derive(Clone, Serialize, Deserialize)]
pub struct WrappingKeyConfig {
    pub id: String,
    #[serde(default = "default_wrap_algorithm")]
    pub algorithm: WrapAlgorithm,
    pub secret: String,
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default = "default_true")]
    pub decrypt: bool,
}

fn default_wrap_algorithm() -> WrapAlgorithm {
    WrapAlgorithm::Aes256Gcm
}

fn default_true() -> bool {
    true
}

impl fmt::Debug for WrappingKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappingKeyConfig")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("secret", &"<redacted>")
            .field("encrypt", &self.encrypt)
            .field("decrypt", &self.decrypt)
            .finish()
    }
}

impl Drop for WrappingKeyConfig {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl WrappingKeyConfig {
    /// A new key with a random secret, allowed to encrypt and decrypt.
    pub fn generate(id: impl Into<String>, algorithm: WrapAlgorithm) -> Result<Self, ConfigError> {
        let id = id.into();
        let secret = KeyBytes::random(WrapAlgorithm::KEY_LEN).map_err(|e| {
            ConfigError::InvalidSecret {
                id: id.clone(),
                reason: e.to_string(),
            }
        })?;
        let hex = secret
            .expose()
            .map(hex::encode)
            .map_err(|e| ConfigError::InvalidSecret {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            id,
            algorithm,
            secret: hex,
            encrypt: true,
            decrypt: true,
        })
    }

    fn key_encryption_key(&self) -> Result<KeyEncryptionKey, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSecret {
            id: self.id.clone(),
            reason,
        };
        let bytes = hex::decode(self.secret.trim()).map_err(|e| invalid(e.to_string()))?;
        KeyEncryptionKey::new(
            WrappingKeyId::new(self.id.clone()),
            self.algorithm,
            KeyBytes::new(bytes),
        )
        .map_err(|e| invalid(e.to_string()))
    }
}

impl CofferConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = Self::from_toml_str(&text);
        text.zeroize();
        parsed
    }

    /// Parse and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// An encrypted filesystem layout with one freshly generated key, as
    /// written by `coffer init-config`.
    pub fn generated(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        Ok(Self {
            store: StoreConfig {
                backend: BackendKind::Filesystem,
                root: root.join("content"),
            },
            encryption: EncryptionConfig {
                enabled: true,
                key_store: Some(root.join("keys")),
                wrapping_keys: vec![WrappingKeyConfig::generate(
                    "kek-1",
                    WrapAlgorithm::Aes256Gcm,
                )?],
                ..Default::default()
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.encryption.validate(self.store.backend)
    }
}

impl EncryptionConfig {
    fn validate(&self, backend: BackendKind) -> Result<(), ConfigError> {
        if !matches!(self.key_bits, 128 | 192 | 256) {
            return Err(ConfigError::UnsupportedKeyBits(self.key_bits));
        }

        let mut seen = HashSet::new();
        for key in &self.wrapping_keys {
            if key.id.is_empty() {
                return Err(ConfigError::EmptyKeyId);
            }
            if !seen.insert(key.id.as_str()) {
                return Err(ConfigError::DuplicateKeyId(key.id.clone()));
            }
            key.key_encryption_key()?;
        }

        if !self.enabled {
            return Ok(());
        }
        if !self.store_unwrapped && !self.wrapping_keys.iter().any(|k| k.encrypt) {
            return Err(ConfigError::NoEncryptingKey);
        }
        if backend == BackendKind::Filesystem && self.key_store.is_none() {
            return Err(ConfigError::MissingKeyStore);
        }
        Ok(())
    }

    /// Build the wrapper list: the clear-text wrapper first, then one
    /// wrapper per configured key in file order.
    ///
    /// Clear-text rows stay readable even when `store_unwrapped` is off.
    pub fn wrappers(&self) -> Result<Vec<Arc<dyn DataEncryptionKeyWrapper>>, ConfigError> {
        let mut wrappers: Vec<Arc<dyn DataEncryptionKeyWrapper>> = Vec::new();
        wrappers.push(Arc::new(if self.store_unwrapped {
            UnencryptedKeyWrapper::new()
        } else {
            UnencryptedKeyWrapper::decrypt_only()
        }));

        for key in &self.wrapping_keys {
            let kek = key.key_encryption_key()?;
            let wrapper = match (key.encrypt, key.decrypt) {
                (true, true) => AeadKeyWrapper::new(kek),
                (true, false) => AeadKeyWrapper::encrypt_only(kek),
                (false, true) => AeadKeyWrapper::decrypt_only([kek]),
                (false, false) => {
                    warn!(id = %key.id, "wrapping key can neither encrypt nor decrypt, skipping");
                    continue;
                }
            };
            wrappers.push(Arc::new(wrapper));
        }
        Ok(wrappers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn encrypted(keys: &str) -> String {
        format!(
            r#"
[store]
backend = "filesystem"
root = "/tmp/coffer"

[encryption]
enabled = true
key_store = "/tmp/coffer-keys"
{keys}
"#
        )
    }

    #[test]
    fn default_config() {
        let c = CofferConfig::default();
        assert_eq!(c.store.backend, BackendKind::Filesystem);
        assert_eq!(c.store.root, PathBuf::from("./coffer-data"));
        assert!(!c.encryption.enabled);
        assert_eq!(c.encryption.key_bits, 256);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn empty_file_is_default() {
        let c = CofferConfig::from_toml_str("").unwrap();
        assert!(!c.encryption.enabled);
    }

    #[test]
    fn parse_full_config() {
        let text = encrypted(&format!(
            r#"
[[encryption.wrapping_keys]]
id = "kek-2024"
algorithm = "xchacha20-poly1305"
secret = "{SECRET}"

[[encryption.wrapping_keys]]
id = "kek-2023"
secret = "{SECRET}"
encrypt = false
"#
        ));
        let c = CofferConfig::from_toml_str(&text).unwrap();
        assert_eq!(c.encryption.wrapping_keys.len(), 2);
        let first = &c.encryption.wrapping_keys[0];
        assert_eq!(first.algorithm, WrapAlgorithm::XChaCha20Poly1305);
        assert!(first.encrypt && first.decrypt);
        let second = &c.encryption.wrapping_keys[1];
        assert_eq!(second.algorithm, WrapAlgorithm::Aes256Gcm);
        assert!(!second.encrypt);

        let wrappers = c.encryption.wrappers().unwrap();
        assert_eq!(wrappers.len(), 3);
        assert_eq!(wrappers.iter().filter(|w| w.can_encrypt()).count(), 1);
    }

    #[test]
    fn memory_backend_parses() {
        let c = CofferConfig::from_toml_str("[store]\nbackend = \"memory\"\n").unwrap();
        assert_eq!(c.store.backend, BackendKind::Memory);
    }

    #[test]
    fn rejects_bad_key_bits() {
        let err = CofferConfig::from_toml_str("[encryption]\nkey_bits = 512\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedKeyBits(512)));
    }

    #[test]
    fn rejects_short_secret() {
        let text = encrypted("[[encryption.wrapping_keys]]\nid = \"k\"\nsecret = \"abcd\"\n");
        assert!(matches!(
            CofferConfig::from_toml_str(&text).unwrap_err(),
            ConfigError::InvalidSecret { .. }
        ));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let key = format!("[[encryption.wrapping_keys]]\nid = \"k\"\nsecret = \"{SECRET}\"\n");
        let text = encrypted(&format!("{key}{key}"));
        assert!(matches!(
            CofferConfig::from_toml_str(&text).unwrap_err(),
            ConfigError::DuplicateKeyId(id) if id == "k"
        ));
    }

    #[test]
    fn enabled_without_encrypting_key_is_rejected() {
        let text = encrypted(&format!(
            "[[encryption.wrapping_keys]]\nid = \"old\"\nsecret = \"{SECRET}\"\nencrypt = false\n"
        ));
        assert!(matches!(
            CofferConfig::from_toml_str(&text).unwrap_err(),
            ConfigError::NoEncryptingKey
        ));
    }

    #[test]
    fn filesystem_encryption_needs_key_store() {
        let text = format!(
            "[encryption]\nenabled = true\n[[encryption.wrapping_keys]]\nid = \"k\"\nsecret = \"{SECRET}\"\n"
        );
        assert!(matches!(
            CofferConfig::from_toml_str(&text).unwrap_err(),
            ConfigError::MissingKeyStore
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let key = WrappingKeyConfig::generate("k", WrapAlgorithm::Aes256Gcm).unwrap();
        let shown = format!("{key:?}");
        assert!(!shown.contains(&key.secret));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn generated_config_round_trips() {
        let c = CofferConfig::generated("/var/lib/coffer").unwrap();
        assert!(c.validate().is_ok());
        let text = c.to_toml_string().unwrap();
        let back = CofferConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.store.root, PathBuf::from("/var/lib/coffer/content"));
        assert_eq!(back.encryption.wrapping_keys[0].secret, c.encryption.wrapping_keys[0].secret);
        assert_eq!(back.encryption.wrapping_keys[0].secret.len(), 64);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CofferConfig::load(dir.path().join("absent.toml")).unwrap_err(),
            ConfigError::Io { .. }
        ));
    }
}
