use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use coffer_crypto::{
    ContentEncryptionEngine, DataEncryptionKeyAccessor, DataEncryptionKeyWrapper,
    EncryptionParameters, StoredDataEncryptionKey,
};
use coffer_store::{
    emulate_range, BoxError, ContentAccessor, ContentReader, ContentSink, ContentStore,
    ContentWriter, ReadError, ReadGuard, ReadResult, StateError, UndecryptableError,
    UnencryptableError, WriteError, WriteGuard, WriteResult,
};
use coffer_types::{AlgorithmId, ContentReference, ResolvedContentRange, WrappingKeyId};
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};

/// Key rows that are destroyed when this value goes away, whatever the exit
/// path.
struct KeyRows(Vec<StoredDataEncryptionKey>);

impl Deref for KeyRows {
    type Target = Vec<StoredDataEncryptionKey>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for KeyRows {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Drop for KeyRows {
    fn drop(&mut self) {
        for row in &mut self.0 {
            row.destroy();
        }
    }
}

/// What a stored key row looks like from the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub wrapping_key_id: WrappingKeyId,
    pub algorithm: AlgorithmId,
    /// Whether this store can unwrap the row and run its algorithm.
    pub decryptable: bool,
}

/// A content store that encrypts everything it writes to a backend store.
///
/// Every object gets a fresh data encryption key from the first configured
/// engine. That key is wrapped by every wrapper able to encrypt and the
/// resulting rows are persisted through the key accessor once the backend
/// has committed the ciphertext. Objects without rows are served as
/// plaintext, so existing unencrypted content stays readable.
pub struct EncryptedContentStore {
    backend: Arc<dyn ContentStore>,
    accessor: Arc<dyn DataEncryptionKeyAccessor>,
    engines: Vec<Arc<dyn ContentEncryptionEngine>>,
    wrappers: Vec<Arc<dyn DataEncryptionKeyWrapper>>,
}

impl EncryptedContentStore {
    pub fn new(
        backend: Arc<dyn ContentStore>,
        accessor: Arc<dyn DataEncryptionKeyAccessor>,
    ) -> Self {
        Self {
            backend,
            accessor,
            engines: Vec::new(),
            wrappers: Vec::new(),
        }
    }

    /// Add an engine. The first one added encrypts new content.
    pub fn with_engine(mut self, engine: Arc<dyn ContentEncryptionEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    pub fn with_wrapper(mut self, wrapper: Arc<dyn DataEncryptionKeyWrapper>) -> Self {
        self.wrappers.push(wrapper);
        self
    }

    pub fn backend(&self) -> &Arc<dyn ContentStore> {
        &self.backend
    }

    fn engine_for(&self, algorithm: &AlgorithmId) -> Option<&Arc<dyn ContentEncryptionEngine>> {
        self.engines.iter().find(|e| e.supports_algorithm(algorithm))
    }

    fn decrypting_wrappers(&self) -> impl Iterator<Item = &Arc<dyn DataEncryptionKeyWrapper>> {
        self.wrappers.iter().filter(|w| w.can_decrypt())
    }

    fn encrypting_wrappers(&self) -> Vec<&Arc<dyn DataEncryptionKeyWrapper>> {
        self.wrappers.iter().filter(|w| w.can_encrypt()).collect()
    }

    fn find_keys(&self, reference: &ContentReference) -> ReadResult<KeyRows> {
        self.accessor
            .find_all_keys(reference)
            .map(KeyRows)
            .map_err(|e| ReadError::KeyLookup {
                reference: reference.clone(),
                source: Box::new(e),
            })
    }

    /// Unwrap the first row any decrypt-capable wrapper and engine can handle.
    fn unwrap_any(
        &self,
        reference: &ContentReference,
        rows: &[StoredDataEncryptionKey],
    ) -> Result<(Arc<dyn ContentEncryptionEngine>, EncryptionParameters), UndecryptableError> {
        let mut supported = BTreeSet::new();
        let mut matched = false;
        let mut unsupported = Vec::new();
        let mut failures: Vec<BoxError> = Vec::new();

        for wrapper in self.decrypting_wrappers() {
            let ids = wrapper.supported_key_ids();
            for row in rows.iter().filter(|r| ids.contains(r.wrapping_key_id())) {
                matched = true;
                let Some(engine) = self.engine_for(row.algorithm()) else {
                    unsupported.push(row.algorithm().clone());
                    continue;
                };
                match wrapper.unwrap(row) {
                    Ok(params) => {
                        debug!(
                            reference = %reference,
                            kek = %row.wrapping_key_id(),
                            "unwrapped data encryption key"
                        );
                        return Ok((Arc::clone(engine), params));
                    }
                    Err(e) => {
                        warn!(
                            reference = %reference,
                            kek = %row.wrapping_key_id(),
                            error = %e,
                            "unwrap attempt failed"
                        );
                        failures.push(Box::new(e));
                    }
                }
            }
            supported.extend(ids);
        }

        if !matched {
            return Err(UndecryptableError::NoDecryptableKeys {
                reference: reference.clone(),
                stored: rows.iter().map(|r| r.wrapping_key_id().clone()).collect(),
                supported: supported.into_iter().collect(),
            });
        }
        if failures.is_empty() {
            unsupported.sort();
            unsupported.dedup();
            return Err(UndecryptableError::UnsupportedAlgorithm {
                reference: reference.clone(),
                algorithms: unsupported,
            });
        }
        let source = failures.remove(0);
        Err(UndecryptableError::UnwrapFailed {
            reference: reference.clone(),
            source,
            suppressed: failures,
        })
    }

    fn can_decrypt_row(&self, row: &StoredDataEncryptionKey) -> bool {
        self.engine_for(row.algorithm()).is_some()
            && self
                .decrypting_wrappers()
                .any(|w| w.supported_key_ids().contains(row.wrapping_key_id()))
    }

    /// The key rows stored for `reference`.
    pub fn describe_keys(&self, reference: &ContentReference) -> ReadResult<Vec<KeyInfo>> {
        let rows = self.find_keys(reference)?;
        Ok(rows
            .iter()
            .map(|row| KeyInfo {
                wrapping_key_id: row.wrapping_key_id().clone(),
                algorithm: row.algorithm().clone(),
                decryptable: self.can_decrypt_row(row),
            })
            .collect())
    }

    /// Add rows for every encrypt-capable wrapper whose key has no row yet,
    /// e.g. after a new key-encryption key was configured. Returns the ids
    /// of the added rows.
    pub fn rewrap(&self, reference: &ContentReference) -> VaultResult<Vec<WrappingKeyId>> {
        let rows = self.find_keys(reference)?;
        if rows.is_empty() {
            return Err(VaultError::NotEncrypted(reference.clone()));
        }
        let (_, mut params) = self.unwrap_any(reference, &rows).map_err(ReadError::from)?;
        let existing: BTreeSet<&WrappingKeyId> = rows.iter().map(|r| r.wrapping_key_id()).collect();

        let mut added = KeyRows(Vec::new());
        for wrapper in self.encrypting_wrappers() {
            let row = wrapper.wrap(&params).map_err(|e| {
                WriteError::from(UnencryptableError::WrapFailed(Box::new(e)))
            })?;
            if existing.contains(row.wrapping_key_id())
                || added.iter().any(|r| r.wrapping_key_id() == row.wrapping_key_id())
            {
                // Dropping the row destroys it.
                continue;
            }
            added.push(row);
        }
        params.destroy();

        if !added.is_empty() {
            self.accessor
                .add_keys(reference, &added)
                .map_err(|e| WriteError::KeyPersistence {
                    reference: reference.clone(),
                    source: Box::new(e),
                })?;
        }
        let ids: Vec<WrappingKeyId> = added.iter().map(|r| r.wrapping_key_id().clone()).collect();
        debug!(reference = %reference, added = ids.len(), "rewrapped content key");
        Ok(ids)
    }

    /// Remove the row wrapped by `wrapping_key_id`, unless no remaining row
    /// could be decrypted by this store afterwards. Returns whether a row was
    /// removed.
    pub fn revoke_wrapping_key(
        &self,
        reference: &ContentReference,
        wrapping_key_id: &WrappingKeyId,
    ) -> VaultResult<bool> {
        let rows = self.find_keys(reference)?;
        if !rows.iter().any(|r| r.wrapping_key_id() == wrapping_key_id) {
            return Ok(false);
        }
        let still_readable = rows
            .iter()
            .filter(|r| r.wrapping_key_id() != wrapping_key_id)
            .any(|r| self.can_decrypt_row(r));
        if !still_readable {
            return Err(VaultError::LastDecryptableKey {
                reference: reference.clone(),
                wrapping_key_id: wrapping_key_id.clone(),
            });
        }

        let removed = self
            .accessor
            .remove_key(reference, wrapping_key_id)
            .map_err(|e| WriteError::KeyPersistence {
                reference: reference.clone(),
                source: Box::new(e),
            })?;
        debug!(reference = %reference, kek = %wrapping_key_id, removed, "revoked key row");
        Ok(removed)
    }
}

impl std::fmt::Debug for EncryptedContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedContentStore")
            .field("engines", &self.engines.len())
            .field("wrappers", &self.wrappers.len())
            .finish_non_exhaustive()
    }
}

impl ContentStore for EncryptedContentStore {
    fn reader(
        &self,
        reference: &ContentReference,
        range: &ResolvedContentRange,
    ) -> ReadResult<Box<dyn ContentReader>> {
        let rows = self.find_keys(reference)?;
        if rows.is_empty() {
            debug!(reference = %reference, "no key rows, reading plaintext");
            return self.backend.reader(reference, range);
        }

        let (engine, params) = self.unwrap_any(reference, &rows)?;
        drop(rows);

        let backend = &self.backend;
        let mut fetch = |aligned: &ResolvedContentRange| -> ReadResult<Box<dyn Read + Send>> {
            backend.reader(reference, aligned)?.content_stream()
        };
        let plaintext = engine.decrypt(reference, &mut fetch, params, range)?;

        Ok(Box::new(ReadGuard::new(DecryptingReader {
            reference: reference.clone(),
            range: *range,
            stream: Mutex::new(Some(plaintext)),
        })))
    }

    fn create_writer(&self) -> WriteResult<Box<dyn ContentWriter>> {
        let engine = self
            .engines
            .first()
            .ok_or(UnencryptableError::NoEncryptionEngine)?;
        let wrappers = self.encrypting_wrappers();
        if wrappers.is_empty() {
            return Err(UnencryptableError::NoEncryptableKeys {
                wrappers: self.wrappers.len(),
            }
            .into());
        }

        let params = engine
            .create_parameters()
            .map_err(|e| UnencryptableError::Cipher(e.to_string()))?;
        let mut keys = KeyRows(Vec::with_capacity(wrappers.len()));
        for wrapper in wrappers {
            let row = wrapper
                .wrap(&params)
                .map_err(|e| UnencryptableError::WrapFailed(Box::new(e)))?;
            keys.push(row);
        }

        // Only now, with the keys in hand, may the backend see a writer.
        let backend_writer: Arc<dyn ContentWriter> = Arc::from(self.backend.create_writer()?);
        Ok(Box::new(WriteGuard::new(EncryptingWriter {
            backend: Arc::clone(&self.backend),
            accessor: Arc::clone(&self.accessor),
            engine: Arc::clone(engine),
            backend_writer,
            pending: Mutex::new(Some(PendingKeys { params, keys })),
        })))
    }

    fn remove(&self, reference: &ContentReference) -> WriteResult<()> {
        self.accessor
            .clear_keys(reference)
            .map_err(|e| WriteError::KeyPersistence {
                reference: reference.clone(),
                source: Box::new(e),
            })?;
        self.backend.remove(reference)
    }

    /// CTR ciphertext is exactly as long as the plaintext.
    fn content_size(&self, reference: &ContentReference) -> ReadResult<u64> {
        self.backend.content_size(reference)
    }
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

struct DecryptingReader {
    reference: ContentReference,
    range: ResolvedContentRange,
    stream: Mutex<Option<Box<dyn Read + Send>>>,
}

impl ContentAccessor for DecryptingReader {
    fn reference(&self) -> Result<ContentReference, StateError> {
        Ok(self.reference.clone())
    }

    fn content_size(&self) -> Result<u64, StateError> {
        Ok(self.range.content_size())
    }

    fn description(&self) -> String {
        format!("encrypted {} ({})", self.reference, self.range)
    }
}

impl ContentReader for DecryptingReader {
    fn range(&self) -> ResolvedContentRange {
        self.range
    }

    fn content_stream(&self) -> ReadResult<Box<dyn Read + Send>> {
        let plaintext = self
            .stream
            .lock()
            .expect("lock poisoned")
            .take()
            .ok_or_else(|| StateError::StreamAlreadyTaken(self.reference.clone()))?;
        Ok(Box::new(emulate_range(plaintext, self.range)))
    }
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

struct PendingKeys {
    params: EncryptionParameters,
    keys: KeyRows,
}

struct EncryptingWriter {
    backend: Arc<dyn ContentStore>,
    accessor: Arc<dyn DataEncryptionKeyAccessor>,
    engine: Arc<dyn ContentEncryptionEngine>,
    backend_writer: Arc<dyn ContentWriter>,
    pending: Mutex<Option<PendingKeys>>,
}

impl ContentAccessor for EncryptingWriter {
    fn reference(&self) -> Result<ContentReference, StateError> {
        self.backend_writer.reference()
    }

    fn content_size(&self) -> Result<u64, StateError> {
        self.backend_writer.content_size()
    }

    fn description(&self) -> String {
        format!("encrypting {}", self.backend_writer.description())
    }
}

impl ContentWriter for EncryptingWriter {
    fn content_sink(&self) -> WriteResult<Box<dyn ContentSink>> {
        let PendingKeys { params, keys } = self
            .pending
            .lock()
            .expect("lock poisoned")
            .take()
            .ok_or_else(|| StateError::SinkAlreadyOpened {
                description: self.description(),
            })?;
        let backend_sink = self.backend_writer.content_sink()?;
        let inner = self.engine.encrypt(backend_sink, params)?;
        Ok(Box::new(EncryptingSink {
            inner,
            backend: Arc::clone(&self.backend),
            backend_writer: Arc::clone(&self.backend_writer),
            accessor: Arc::clone(&self.accessor),
            keys,
        }))
    }
}

struct EncryptingSink {
    inner: Box<dyn ContentSink>,
    backend: Arc<dyn ContentStore>,
    backend_writer: Arc<dyn ContentWriter>,
    accessor: Arc<dyn DataEncryptionKeyAccessor>,
    keys: KeyRows,
}

impl Write for EncryptingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ContentSink for EncryptingSink {
    fn finish(self: Box<Self>) -> WriteResult<()> {
        let EncryptingSink {
            inner,
            backend,
            backend_writer,
            accessor,
            keys,
        } = *self;
        inner.finish()?;
        let reference = backend_writer.reference()?;

        if let Err(e) = accessor.add_keys(&reference, &keys) {
            warn!(reference = %reference, error = %e, "persisting key rows failed, removing ciphertext");
            if let Err(rm) = backend.remove(&reference) {
                warn!(reference = %reference, error = %rm, "removing orphaned ciphertext failed");
            }
            return Err(WriteError::KeyPersistence {
                reference,
                source: Box::new(e),
            });
        }
        debug!(reference = %reference, rows = keys.len(), "stored encrypted content");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_crypto::{
        AccessorError, AccessorResult, AeadKeyWrapper, AesCtrEngine, FileKeyAccessor,
        InMemoryKeyAccessor, KeyBytes, KeyCopy, KeyEncryptionKey, KeyError,
        UnencryptedKeyWrapper, WrapAlgorithm,
    };
    use coffer_store::{
        read_range_to_vec, FileSystemContentStore, InMemoryContentStore, InMemoryObjectStorage,
        ObjectContentStore, ObjectStorageClient,
    };
    use std::thread;

    fn kek(id: &str, byte: u8) -> KeyEncryptionKey {
        KeyEncryptionKey::new(
            WrappingKeyId::new(id),
            WrapAlgorithm::Aes256Gcm,
            KeyBytes::from_slice(&[byte; 32]),
        )
        .unwrap()
    }

    fn vault(
        backend: Arc<dyn ContentStore>,
        accessor: Arc<dyn DataEncryptionKeyAccessor>,
        wrapper: AeadKeyWrapper,
    ) -> EncryptedContentStore {
        EncryptedContentStore::new(backend, accessor)
            .with_engine(Arc::new(AesCtrEngine::default()))
            .with_wrapper(Arc::new(wrapper))
    }

    fn memory_vault() -> (Arc<InMemoryContentStore>, Arc<InMemoryKeyAccessor>, EncryptedContentStore) {
        let backend = Arc::new(InMemoryContentStore::new());
        let accessor = Arc::new(InMemoryKeyAccessor::new());
        let store = vault(backend.clone(), accessor.clone(), AeadKeyWrapper::new(kek("k1", 1)));
        (backend, accessor, store)
    }

    fn put(store: &dyn ContentStore, data: &[u8]) -> ContentReference {
        store.write_content(&mut &data[..]).unwrap().reference().unwrap()
    }

    fn get(store: &dyn ContentStore, r: &ContentReference, start: u64, end: u64) -> ReadResult<Vec<u8>> {
        let size = store.content_size(r)?;
        let range = ResolvedContentRange::new(start, end, size)?;
        read_range_to_vec(store.reader(r, &range)?.as_ref())
    }

    // ----------------------------------------------------------------
    // Write safety
    // ----------------------------------------------------------------

    #[test]
    fn no_encryptable_wrapper_writes_nothing() {
        let backend = Arc::new(InMemoryContentStore::new());
        let store = EncryptedContentStore::new(backend.clone(), Arc::new(InMemoryKeyAccessor::new()))
            .with_engine(Arc::new(AesCtrEngine::default()))
            .with_wrapper(Arc::new(UnencryptedKeyWrapper::decrypt_only()))
            .with_wrapper(Arc::new(AeadKeyWrapper::decrypt_only([kek("old", 2)])));

        let err = store.create_writer().err().unwrap();
        assert!(matches!(
            err,
            WriteError::Unencryptable(UnencryptableError::NoEncryptableKeys { wrappers: 2 })
        ));
        assert!(store.write_content(&mut &b"secret"[..]).is_err());
        assert!(backend.is_empty());
    }

    #[test]
    fn no_engine_is_unencryptable() {
        let store = EncryptedContentStore::new(
            Arc::new(InMemoryContentStore::new()),
            Arc::new(InMemoryKeyAccessor::new()),
        )
        .with_wrapper(Arc::new(UnencryptedKeyWrapper::new()));
        assert!(matches!(
            store.create_writer().err().unwrap(),
            WriteError::Unencryptable(UnencryptableError::NoEncryptionEngine)
        ));
    }

    #[test]
    fn abandoned_sink_persists_no_keys() {
        let (backend, accessor, store) = memory_vault();
        let writer = store.create_writer().unwrap();
        {
            let mut sink = writer.content_sink().unwrap();
            sink.write_all(b"half").unwrap();
        }
        assert!(writer.reference().is_err());
        assert!(backend.is_empty());
        assert!(accessor.is_empty());
    }

    #[test]
    fn sink_opens_once() {
        let (_, _, store) = memory_vault();
        let writer = store.create_writer().unwrap();
        let _sink = writer.content_sink().unwrap();
        assert!(matches!(
            writer.content_sink().err().unwrap(),
            WriteError::State(StateError::SinkAlreadyOpened { .. })
        ));
    }

    struct FailingAccessor;

    impl DataEncryptionKeyAccessor for FailingAccessor {
        fn find_all_keys(&self, _: &ContentReference) -> AccessorResult<Vec<StoredDataEncryptionKey>> {
            Ok(Vec::new())
        }
        fn add_keys(&self, _: &ContentReference, _: &[StoredDataEncryptionKey]) -> AccessorResult<()> {
            Err(AccessorError::Io {
                path: "keys".into(),
                source: io::Error::other("read-only"),
            })
        }
        fn remove_key(&self, _: &ContentReference, _: &WrappingKeyId) -> AccessorResult<bool> {
            Ok(false)
        }
        fn clear_keys(&self, _: &ContentReference) -> AccessorResult<()> {
            Ok(())
        }
    }

    #[test]
    fn key_persistence_failure_removes_ciphertext() {
        let backend = Arc::new(InMemoryContentStore::new());
        let store = vault(backend.clone(), Arc::new(FailingAccessor), AeadKeyWrapper::new(kek("k", 1)));
        let err = store.write_content(&mut &b"orphan"[..]).err().unwrap();
        assert!(matches!(err, WriteError::KeyPersistence { .. }));
        assert!(backend.is_empty());
    }

    // ----------------------------------------------------------------
    // Round trips
    // ----------------------------------------------------------------

    #[test]
    fn filesystem_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileSystemContentStore::open(dir.path().join("content")).unwrap());
        let accessor = Arc::new(FileKeyAccessor::open(dir.path().join("keys")).unwrap());
        let store = vault(backend.clone(), accessor, AeadKeyWrapper::new(kek("k1", 7)));

        let r = put(&store, b"Test data");
        assert_eq!(store.content_size(&r).unwrap(), 9);
        assert_eq!(get(&store, &r, 5, 7).unwrap(), b"dat");
        assert_eq!(get(&store, &r, 0, 8).unwrap(), b"Test data");

        let on_disk = std::fs::read(backend.root().join(r.as_str())).unwrap();
        assert_eq!(on_disk.len(), 9);
        assert_ne!(on_disk, b"Test data");

        store.remove(&r).unwrap();
        store.remove(&r).unwrap();
        assert!(store.content_size(&r).is_err());
    }

    #[test]
    fn ranges_across_block_boundaries() {
        let (_, _, store) = memory_vault();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let r = put(&store, &data);
        for (s, e) in [(0, 0), (15, 16), (16, 31), (17, 500), (999, 999), (0, 999)] {
            assert_eq!(get(&store, &r, s, e).unwrap(), &data[s as usize..=e as usize]);
        }
    }

    #[test]
    fn stream_zero_fills_outside_range() {
        let (_, _, store) = memory_vault();
        let r = put(&store, b"0123456789abcdefXYZ");
        let range = ResolvedContentRange::new(17, 18, 19).unwrap();
        let mut all = Vec::new();
        store
            .reader(&r, &range)
            .unwrap()
            .content_stream()
            .unwrap()
            .read_to_end(&mut all)
            .unwrap();
        let mut expected = vec![0u8; 17];
        expected.extend_from_slice(b"YZ");
        assert_eq!(all, expected);
    }

    #[test]
    fn stream_is_taken_once() {
        let (_, _, store) = memory_vault();
        let r = put(&store, b"once");
        let reader = store.reader(&r, &ResolvedContentRange::full(4).unwrap()).unwrap();
        let _ = reader.content_stream().unwrap();
        assert!(matches!(
            reader.content_stream().err().unwrap(),
            ReadError::State(StateError::StreamAlreadyTaken(_))
        ));
    }

    #[test]
    fn plaintext_content_passes_through() {
        let (backend, _, store) = memory_vault();
        let r = put(backend.as_ref(), b"legacy plaintext");
        assert_eq!(get(&store, &r, 7, 15).unwrap(), b"plaintext");
    }

    #[test]
    fn every_encrypting_wrapper_gets_a_row() {
        let backend = Arc::new(InMemoryContentStore::new());
        let accessor = Arc::new(InMemoryKeyAccessor::new());
        let store = vault(backend, accessor.clone(), AeadKeyWrapper::new(kek("k1", 1)))
            .with_wrapper(Arc::new(UnencryptedKeyWrapper::new()));
        let r = put(&store, b"two rows");

        let mut ids: Vec<_> = accessor
            .find_all_keys(&r)
            .unwrap()
            .iter()
            .map(|k| k.wrapping_key_id().clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![WrappingKeyId::unwrapped(), WrappingKeyId::new("k1")]);

        // The clear row alone is enough to read.
        let clear_only = EncryptedContentStore::new(store.backend().clone(), accessor)
            .with_engine(Arc::new(AesCtrEngine::default()))
            .with_wrapper(Arc::new(UnencryptedKeyWrapper::decrypt_only()));
        assert_eq!(get(&clear_only, &r, 0, 7).unwrap(), b"two rows");
    }

    #[test]
    fn object_backend_serves_block_ranges_natively() {
        let client = Arc::new(InMemoryObjectStorage::new());
        let backend = Arc::new(ObjectContentStore::new(client.clone(), "vault/"));
        let store = vault(backend, Arc::new(InMemoryKeyAccessor::new()), AeadKeyWrapper::new(kek("k1", 1)));
        let data: Vec<u8> = (0..100u8).collect();
        let r = put(&store, &data);

        let key = format!("vault/{}", r.as_str());
        assert_eq!(client.keys(), vec![key.clone()]);
        let mut stored = Vec::new();
        client.get_object(&key, None).unwrap().read_to_end(&mut stored).unwrap();
        assert_eq!(stored.len(), 100);
        assert_ne!(stored, data);

        for (s, e) in [(0, 99), (24, 63), (17, 17), (99, 99)] {
            assert_eq!(get(&store, &r, s, e).unwrap(), &data[s as usize..=e as usize]);
        }
        // Only the full read goes out without a range header.
        assert_eq!(client.ranged_get_count(), 3);
    }

    #[test]
    fn concurrent_readers() {
        let (_, _, store) = memory_vault();
        let store = Arc::new(store);
        let data: Vec<u8> = (0..200u8).collect();
        let r = put(store.as_ref(), &data);
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let store = Arc::clone(&store);
                let r = r.clone();
                thread::spawn(move || get(store.as_ref(), &r, i * 10, i * 10 + 50).unwrap())
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            let start = i * 10;
            assert_eq!(h.join().unwrap(), &data[start..=start + 50]);
        }
    }

    // ----------------------------------------------------------------
    // Undecryptable content
    // ----------------------------------------------------------------

    #[test]
    fn unknown_kek_is_no_decryptable_keys() {
        let (backend, accessor, store) = memory_vault();
        let r = put(&store, b"locked");
        let other = vault(backend, accessor, AeadKeyWrapper::new(kek("k2", 2)));
        match get(&other, &r, 0, 5).unwrap_err() {
            ReadError::Undecryptable(UndecryptableError::NoDecryptableKeys {
                stored, supported, ..
            }) => {
                assert_eq!(stored, vec![WrappingKeyId::new("k1")]);
                assert_eq!(supported, vec![WrappingKeyId::new("k2")]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn missing_engine_is_unsupported_algorithm() {
        let (backend, accessor, store) = memory_vault();
        let r = put(&store, b"no engine");
        let engineless = EncryptedContentStore::new(backend, accessor)
            .with_wrapper(Arc::new(AeadKeyWrapper::new(kek("k1", 1))));
        assert!(matches!(
            get(&engineless, &r, 0, 0).unwrap_err(),
            ReadError::Undecryptable(UndecryptableError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn wrong_secret_is_unwrap_failed() {
        let (backend, accessor, store) = memory_vault();
        let r = put(&store, b"wrong key");
        let impostor = vault(backend, accessor, AeadKeyWrapper::new(kek("k1", 99)))
            .with_wrapper(Arc::new(AeadKeyWrapper::decrypt_only([kek("k1", 98)])));
        match get(&impostor, &r, 0, 0).unwrap_err() {
            ReadError::Undecryptable(UndecryptableError::UnwrapFailed { suppressed, .. }) => {
                assert_eq!(suppressed.len(), 1);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    // ----------------------------------------------------------------
    // Key destruction
    // ----------------------------------------------------------------

    /// Serves fresh rows on every lookup and keeps a copy of each wrapped
    /// key, so a test can see how the rows were disposed of.
    #[derive(Default)]
    struct WatchedAccessor {
        inner: InMemoryKeyAccessor,
        issued: Mutex<Vec<KeyCopy>>,
    }

    impl WatchedAccessor {
        fn take_issued(&self) -> Vec<KeyCopy> {
            std::mem::take(&mut *self.issued.lock().unwrap())
        }
    }

    impl DataEncryptionKeyAccessor for WatchedAccessor {
        fn find_all_keys(&self, r: &ContentReference) -> AccessorResult<Vec<StoredDataEncryptionKey>> {
            let mut issued = self.issued.lock().unwrap();
            self.inner
                .find_all_keys(r)?
                .iter()
                .map(|row| -> AccessorResult<StoredDataEncryptionKey> {
                    let wrapped = KeyBytes::from_slice(row.wrapped_key()?);
                    issued.push(wrapped.copy()?);
                    Ok(StoredDataEncryptionKey::new(
                        row.algorithm().clone(),
                        row.wrapping_key_id().clone(),
                        wrapped,
                        row.iv().to_vec(),
                    ))
                })
                .collect()
        }
        fn add_keys(&self, r: &ContentReference, keys: &[StoredDataEncryptionKey]) -> AccessorResult<()> {
            self.inner.add_keys(r, keys)
        }
        fn remove_key(&self, r: &ContentReference, id: &WrappingKeyId) -> AccessorResult<bool> {
            self.inner.remove_key(r, id)
        }
        fn clear_keys(&self, r: &ContentReference) -> AccessorResult<()> {
            self.inner.clear_keys(r)
        }
    }

    /// Every row handed out since the last call was destroyed explicitly by
    /// this module rather than dropped.
    fn assert_rows_destroyed(accessor: &WatchedAccessor, expected: usize) {
        let issued = accessor.take_issued();
        assert_eq!(issued.len(), expected);
        for copy in &issued {
            match copy.with_bytes(|b| b.len()) {
                Err(KeyError::Destroyed { destroyed_at }) => {
                    assert_eq!(destroyed_at.file(), file!());
                }
                other => panic!("expected Destroyed, got {other:?}"),
            }
        }
    }

    #[test]
    fn rows_are_destroyed_after_successful_read() {
        let backend = Arc::new(InMemoryContentStore::new());
        let accessor = Arc::new(WatchedAccessor::default());
        let store = vault(backend, accessor.clone(), AeadKeyWrapper::new(kek("k1", 1)))
            .with_wrapper(Arc::new(UnencryptedKeyWrapper::new()));
        let r = put(&store, b"short lived keys");
        assert!(accessor.take_issued().is_empty());

        assert_eq!(get(&store, &r, 6, 9).unwrap(), b"live");
        assert_rows_destroyed(&accessor, 2);
    }

    #[test]
    fn rows_are_destroyed_when_unwrap_fails() {
        let backend: Arc<dyn ContentStore> = Arc::new(InMemoryContentStore::new());
        let accessor = Arc::new(WatchedAccessor::default());
        let store = vault(backend.clone(), accessor.clone(), AeadKeyWrapper::new(kek("k1", 1)));
        let r = put(&store, b"wrong key");

        let impostor = vault(backend, accessor.clone(), AeadKeyWrapper::new(kek("k1", 99)));
        assert!(matches!(
            get(&impostor, &r, 0, 0).unwrap_err(),
            ReadError::Undecryptable(UndecryptableError::UnwrapFailed { .. })
        ));
        assert_rows_destroyed(&accessor, 1);
    }

    #[test]
    fn rows_are_destroyed_when_algorithm_is_unsupported() {
        let backend: Arc<dyn ContentStore> = Arc::new(InMemoryContentStore::new());
        let accessor = Arc::new(WatchedAccessor::default());
        let store = vault(backend.clone(), accessor.clone(), AeadKeyWrapper::new(kek("k1", 1)));
        let r = put(&store, b"no engine");

        let engineless = EncryptedContentStore::new(backend, accessor.clone())
            .with_wrapper(Arc::new(AeadKeyWrapper::new(kek("k1", 1))));
        assert!(matches!(
            get(&engineless, &r, 0, 0).unwrap_err(),
            ReadError::Undecryptable(UndecryptableError::UnsupportedAlgorithm { .. })
        ));
        assert_rows_destroyed(&accessor, 1);
    }

    // ----------------------------------------------------------------
    // Key maintenance
    // ----------------------------------------------------------------

    #[test]
    fn rotation_with_rewrap_and_revoke() {
        let backend: Arc<dyn ContentStore> = Arc::new(InMemoryContentStore::new());
        let accessor: Arc<dyn DataEncryptionKeyAccessor> = Arc::new(InMemoryKeyAccessor::new());
        let old = vault(backend.clone(), accessor.clone(), AeadKeyWrapper::new(kek("old", 1)));
        let r = put(&old, b"rotate me");

        let rotated = vault(
            backend.clone(),
            accessor.clone(),
            AeadKeyWrapper::new(kek("new", 2)).with_decryption_key(kek("old", 1)),
        );
        assert_eq!(get(&rotated, &r, 0, 8).unwrap(), b"rotate me");
        assert_eq!(rotated.rewrap(&r).unwrap(), vec![WrappingKeyId::new("new")]);
        assert!(rotated.rewrap(&r).unwrap().is_empty());

        assert!(rotated.revoke_wrapping_key(&r, &WrappingKeyId::new("old")).unwrap());
        assert!(!rotated.revoke_wrapping_key(&r, &WrappingKeyId::new("old")).unwrap());
        assert!(matches!(
            rotated.revoke_wrapping_key(&r, &WrappingKeyId::new("new")),
            Err(VaultError::LastDecryptableKey { .. })
        ));

        let new_only = vault(backend, accessor, AeadKeyWrapper::new(kek("new", 2)));
        assert_eq!(get(&new_only, &r, 7, 8).unwrap(), b"me");
        let keys = new_only.describe_keys(&r).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].decryptable);
    }

    #[test]
    fn rewrap_plaintext_is_rejected() {
        let (backend, _, store) = memory_vault();
        let r = put(backend.as_ref(), b"clear");
        assert!(matches!(store.rewrap(&r), Err(VaultError::NotEncrypted(_))));
    }

    #[test]
    fn remove_clears_keys_first() {
        let (backend, accessor, store) = memory_vault();
        let r = put(&store, b"remove me");
        store.remove(&r).unwrap();
        assert!(accessor.find_all_keys(&r).unwrap().is_empty());
        assert!(backend.is_empty());
    }
}
