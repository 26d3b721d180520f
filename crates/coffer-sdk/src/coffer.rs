use std::io::{self, Read, Write};
use std::sync::Arc;

use coffer_crypto::{AesCtrEngine, DataEncryptionKeyAccessor, FileKeyAccessor, InMemoryKeyAccessor};
use coffer_store::{
    skip_exact, ContentStore, FileSystemContentStore, InMemoryContentStore, ReadError, WriteError,
};
use coffer_types::{ContentRangeRequest, ContentReference, ResolvedContentRange, WrappingKeyId};
use coffer_vault::{EncryptedContentStore, KeyInfo};
use tracing::{debug, info};

use crate::config::{BackendKind, CofferConfig};
use crate::error::{SdkError, SdkResult};

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub reference: ContentReference,
    pub size: u64,
}

/// A configured content store, optionally encrypting.
pub struct Coffer {
    store: Arc<dyn ContentStore>,
    vault: Option<Arc<EncryptedContentStore>>,
}

/// Assemble the store described by `config`.
pub fn open_store(config: &CofferConfig) -> SdkResult<Arc<dyn ContentStore>> {
    Ok(Coffer::open(config)?.store)
}

impl Coffer {
    pub fn open(config: &CofferConfig) -> SdkResult<Self> {
        config.validate()?;

        let backend: Arc<dyn ContentStore> = match config.store.backend {
            BackendKind::Filesystem => {
                let root = &config.store.root;
                let store =
                    FileSystemContentStore::open(root).map_err(|source| SdkError::Open {
                        path: root.clone(),
                        source,
                    })?;
                Arc::new(store)
            }
            BackendKind::Memory => Arc::new(InMemoryContentStore::new()),
        };

        let encryption = &config.encryption;
        if !encryption.enabled {
            info!(backend = ?config.store.backend, "opened plaintext store");
            return Ok(Self {
                store: backend,
                vault: None,
            });
        }

        let accessor: Arc<dyn DataEncryptionKeyAccessor> = match &encryption.key_store {
            Some(dir) => Arc::new(FileKeyAccessor::open(dir)?),
            None => Arc::new(InMemoryKeyAccessor::new()),
        };
        let mut vault = EncryptedContentStore::new(backend, accessor)
            .with_engine(Arc::new(AesCtrEngine::new(encryption.key_bits)?));
        for wrapper in encryption.wrappers()? {
            vault = vault.with_wrapper(wrapper);
        }

        info!(
            backend = ?config.store.backend,
            key_bits = encryption.key_bits,
            wrapping_keys = encryption.wrapping_keys.len(),
            "opened encrypted store"
        );
        let vault = Arc::new(vault);
        Ok(Self {
            store: vault.clone(),
            vault: Some(vault),
        })
    }

    /// Wrap an already assembled store.
    pub fn from_store(store: Arc<dyn ContentStore>) -> Self {
        Self { store, vault: None }
    }

    pub fn from_vault(vault: Arc<EncryptedContentStore>) -> Self {
        Self {
            store: vault.clone(),
            vault: Some(vault),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn is_encrypted(&self) -> bool {
        self.vault.is_some()
    }

    fn vault(&self) -> SdkResult<&EncryptedContentStore> {
        self.vault.as_deref().ok_or(SdkError::EncryptionDisabled)
    }

    // ---- Content operations ----

    pub fn put(&self, source: &mut dyn Read) -> SdkResult<StoredContent> {
        let writer = self.store.write_content(source)?;
        let reference = writer.reference().map_err(WriteError::from)?;
        let size = writer.content_size().map_err(WriteError::from)?;
        debug!(reference = %reference, size, "stored content");
        Ok(StoredContent { reference, size })
    }

    pub fn put_bytes(&self, data: &[u8]) -> SdkResult<StoredContent> {
        self.put(&mut &data[..])
    }

    pub fn content_size(&self, reference: &ContentReference) -> SdkResult<u64> {
        Ok(self.store.content_size(reference)?)
    }

    /// Copy the bytes selected by `request` to `out`.
    ///
    /// Returns the resolved range, or `None` for empty content, which has no
    /// satisfiable range and copies nothing.
    pub fn read_to(
        &self,
        reference: &ContentReference,
        request: &ContentRangeRequest,
        out: &mut dyn Write,
    ) -> SdkResult<Option<ResolvedContentRange>> {
        let size = self.store.content_size(reference)?;
        if size == 0 {
            return Ok(None);
        }
        let range = request.resolve(size)?;

        let reader = self.store.reader(reference, &range)?;
        let mut stream = reader.content_stream()?;
        skip_exact(&mut stream, range.start()).map_err(|e| ReadError::io(reference, e))?;
        let copied = io::copy(&mut stream.take(range.range_size()), out).map_err(SdkError::Stream)?;
        if copied != range.range_size() {
            let short = io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, got {copied}", range.range_size()),
            );
            return Err(ReadError::io(reference, short).into());
        }
        Ok(Some(range))
    }

    pub fn read_bytes(
        &self,
        reference: &ContentReference,
        request: &ContentRangeRequest,
    ) -> SdkResult<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to(reference, request, &mut out)?;
        Ok(out)
    }

    pub fn remove(&self, reference: &ContentReference) -> SdkResult<()> {
        Ok(self.store.remove(reference)?)
    }

    // ---- Key operations ----

    pub fn describe_keys(&self, reference: &ContentReference) -> SdkResult<Vec<KeyInfo>> {
        Ok(self.vault()?.describe_keys(reference)?)
    }

    pub fn rewrap(&self, reference: &ContentReference) -> SdkResult<Vec<WrappingKeyId>> {
        Ok(self.vault()?.rewrap(reference)?)
    }

    pub fn revoke_wrapping_key(
        &self,
        reference: &ContentReference,
        wrapping_key_id: &WrappingKeyId,
    ) -> SdkResult<bool> {
        Ok(self.vault()?.revoke_wrapping_key(reference, wrapping_key_id)?)
    }
}

impl std::fmt::Debug for Coffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coffer")
            .field("encrypted", &self.is_encrypted())
            .finish_non_exhaustive()
    }
}
