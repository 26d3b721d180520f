//! Content store over an object-storage service.
//!
//! The service is reached through [`ObjectStorageClient`], a blocking
//! interface covering the four calls the store needs. Reads issue a native
//! ranged GET, so only the bytes of the requested range travel. Writes are
//! spooled to an anonymous temporary file and uploaded in one PUT when the
//! sink finishes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, OnceLock, RwLock};

use coffer_types::{ContentReference, ResolvedContentRange};
use tracing::{debug, warn};

use crate::error::{ReadError, ReadResult, StateError, WriteError, WriteResult};
use crate::guard::{ReadGuard, WriteGuard};
use crate::stream::{CountingWriter, RangeWindowReader};
use crate::traits::{ContentAccessor, ContentReader, ContentSink, ContentStore, ContentWriter};

/// Minimal blocking client for an object-storage service.
///
/// Missing objects are reported as `None` by [`head_object`](Self::head_object)
/// and as [`io::ErrorKind::NotFound`] by [`get_object`](Self::get_object).
pub trait ObjectStorageClient: Send + Sync {
    /// Size of the object under `key`, or `None` if it does not exist.
    fn head_object(&self, key: &str) -> io::Result<Option<u64>>;

    /// Body of the object under `key`. With `range = Some((start, end))` only
    /// the bytes `start..=end` are returned.
    fn get_object(&self, key: &str, range: Option<(u64, u64)>)
        -> io::Result<Box<dyn Read + Send>>;

    /// Upload `size` bytes from `body` as the object under `key`.
    fn put_object(&self, key: &str, body: &mut dyn Read, size: u64) -> io::Result<()>;

    /// Delete the object under `key`. Deleting a missing object succeeds.
    fn delete_object(&self, key: &str) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// InMemoryObjectStorage
// ---------------------------------------------------------------------------

/// [`ObjectStorageClient`] keeping objects in a map. Counts ranged GETs so
/// tests can verify that reads are served natively.
#[derive(Default)]
pub struct InMemoryObjectStorage {
    objects: RwLock<HashMap<String, Arc<[u8]>>>,
    ranged_gets: std::sync::atomic::AtomicU64,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of all stored objects, sorted.
    pub fn keys(&self) -> Vec<String> {
        let map = self.objects.read().expect("lock poisoned");
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of GET requests that carried a range.
    pub fn ranged_get_count(&self) -> u64 {
        self.ranged_gets.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl ObjectStorageClient for InMemoryObjectStorage {
    fn head_object(&self, key: &str) -> io::Result<Option<u64>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(key).map(|data| data.len() as u64))
    }

    fn get_object(
        &self,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> io::Result<Box<dyn Read + Send>> {
        let data = {
            let map = self.objects.read().expect("lock poisoned");
            map.get(key).cloned().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no such key: {key}"))
            })?
        };
        let Some((start, end)) = range else {
            return Ok(Box::new(Cursor::new(data)));
        };
        self.ranged_gets
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let len = data.len() as u64;
        if start > end || end >= len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {start}-{end} not satisfiable for {len} bytes"),
            ));
        }
        Ok(Box::new(Cursor::new(
            data[start as usize..=end as usize].to_vec(),
        )))
    }

    fn put_object(&self, key: &str, body: &mut dyn Read, size: u64) -> io::Result<()> {
        let mut data = Vec::with_capacity(size as usize);
        body.read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("declared {size} bytes, received {}", data.len()),
            ));
        }
        self.objects
            .write()
            .expect("lock poisoned")
            .insert(key.to_string(), data.into());
        Ok(())
    }

    fn delete_object(&self, key: &str) -> io::Result<()> {
        self.objects.write().expect("lock poisoned").remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ObjectContentStore
// ---------------------------------------------------------------------------

/// Content store mapping each reference to the object `<prefix><reference>`.
#[derive(Clone)]
pub struct ObjectContentStore {
    client: Arc<dyn ObjectStorageClient>,
    prefix: String,
}

impl ObjectContentStore {
    pub fn new(client: Arc<dyn ObjectStorageClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key_for(&self, reference: &ContentReference) -> String {
        format!("{}{}", self.prefix, reference)
    }

    fn head(&self, reference: &ContentReference) -> ReadResult<u64> {
        self.client
            .head_object(&self.key_for(reference))
            .map_err(|e| ReadError::io(reference, e))?
            .ok_or_else(|| ReadError::NotFound(reference.clone()))
    }
}

impl std::fmt::Debug for ObjectContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectContentStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ContentStore for ObjectContentStore {
    fn reader(
        &self,
        reference: &ContentReference,
        range: &ResolvedContentRange,
    ) -> ReadResult<Box<dyn ContentReader>> {
        let actual = self.head(reference)?;
        if actual != range.content_size() {
            return Err(ReadError::SizeMismatch {
                reference: reference.clone(),
                expected: range.content_size(),
                actual,
            });
        }
        Ok(Box::new(ReadGuard::new(ObjectReader {
            client: Arc::clone(&self.client),
            key: self.key_for(reference),
            reference: reference.clone(),
            range: *range,
        })))
    }

    fn create_writer(&self) -> WriteResult<Box<dyn ContentWriter>> {
        let reference = ContentReference::generate();
        Ok(Box::new(WriteGuard::new(ObjectWriter {
            client: Arc::clone(&self.client),
            key: self.key_for(&reference),
            reference,
            committed: Arc::new(OnceLock::new()),
        })))
    }

    fn remove(&self, reference: &ContentReference) -> WriteResult<()> {
        self.client
            .delete_object(&self.key_for(reference))
            .map_err(|e| WriteError::io(Some(reference), e))?;
        debug!(reference = %reference, "deleted object");
        Ok(())
    }

    fn content_size(&self, reference: &ContentReference) -> ReadResult<u64> {
        self.head(reference)
    }
}

struct ObjectReader {
    client: Arc<dyn ObjectStorageClient>,
    key: String,
    reference: ContentReference,
    range: ResolvedContentRange,
}

impl ContentAccessor for ObjectReader {
    fn reference(&self) -> Result<ContentReference, StateError> {
        Ok(self.reference.clone())
    }

    fn content_size(&self) -> Result<u64, StateError> {
        Ok(self.range.content_size())
    }

    fn description(&self) -> String {
        format!("object {} ({})", self.key, self.range)
    }
}

impl ContentReader for ObjectReader {
    fn range(&self) -> ResolvedContentRange {
        self.range
    }

    fn content_stream(&self) -> ReadResult<Box<dyn Read + Send>> {
        let requested = (!self.range.is_full())
            .then(|| (self.range.start(), self.range.end_inclusive()));
        debug!(key = %self.key, range = %self.range, native = requested.is_some(), "GET object");
        let body = self
            .client
            .get_object(&self.key, requested)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ReadError::NotFound(self.reference.clone()),
                _ => ReadError::io(&self.reference, e),
            })?;
        Ok(Box::new(RangeWindowReader::new(body, self.range)))
    }
}

struct ObjectWriter {
    client: Arc<dyn ObjectStorageClient>,
    key: String,
    reference: ContentReference,
    committed: Arc<OnceLock<u64>>,
}

impl ContentAccessor for ObjectWriter {
    fn reference(&self) -> Result<ContentReference, StateError> {
        Ok(self.reference.clone())
    }

    fn content_size(&self) -> Result<u64, StateError> {
        self.committed
            .get()
            .copied()
            .ok_or_else(|| StateError::NotClosed {
                description: self.description(),
            })
    }

    fn description(&self) -> String {
        format!("object writer {}", self.key)
    }
}

impl ContentWriter for ObjectWriter {
    fn content_sink(&self) -> WriteResult<Box<dyn ContentSink>> {
        let spool = tempfile::tempfile().map_err(|e| WriteError::io(None, e))?;
        Ok(Box::new(ObjectSink {
            spool: CountingWriter::new(BufWriter::new(spool)),
            client: Arc::clone(&self.client),
            key: self.key.clone(),
            reference: self.reference.clone(),
            committed: Arc::clone(&self.committed),
        }))
    }
}

struct ObjectSink {
    spool: CountingWriter<BufWriter<File>>,
    client: Arc<dyn ObjectStorageClient>,
    key: String,
    reference: ContentReference,
    committed: Arc<OnceLock<u64>>,
}

impl Write for ObjectSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.spool.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.spool.flush()
    }
}

impl ContentSink for ObjectSink {
    fn finish(self: Box<Self>) -> WriteResult<()> {
        let ObjectSink {
            spool,
            client,
            key,
            reference,
            committed,
        } = *self;
        let size = spool.bytes_written();
        let fail = |e: io::Error| WriteError::io(Some(&reference), e);

        let mut file = spool
            .into_inner()
            .into_inner()
            .map_err(|e| fail(e.into_error()))?;
        file.seek(SeekFrom::Start(0)).map_err(fail)?;
        if let Err(e) = client.put_object(&key, &mut file, size) {
            warn!(key = %key, error = %e, "PUT object failed");
            return Err(fail(e));
        }

        let _ = committed.set(size);
        debug!(key = %key, size, "uploaded object");
        Ok(())
    }
}
