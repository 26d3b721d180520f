use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, OnceLock, RwLock};

use coffer_types::{ContentReference, ResolvedContentRange};
use tracing::debug;

use crate::error::{ReadError, ReadResult, StateError, WriteResult};
use crate::guard::{ReadGuard, WriteGuard};
use crate::stream::{emulate_range, CountingWriter};
use crate::traits::{ContentAccessor, ContentReader, ContentSink, ContentStore, ContentWriter};

type ObjectMap = HashMap<ContentReference, Arc<[u8]>>;

/// In-memory, HashMap-based content store.
///
/// Intended for tests and embedding. Contents are held behind a `RwLock` and
/// shared with readers, so a reader keeps seeing the bytes it was opened on
/// even if the object is removed meanwhile. This backend cannot position a
/// stream natively; ranges are served through [`emulate_range`].
pub struct InMemoryContentStore {
    objects: Arc<RwLock<ObjectMap>>,
}

impl InMemoryContentStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }

    /// Remove all objects from the store.
    pub fn clear(&self) {
        self.objects.write().expect("lock poisoned").clear();
    }

    /// Return a sorted list of all references in the store.
    pub fn all_references(&self) -> Vec<ContentReference> {
        let map = self.objects.read().expect("lock poisoned");
        let mut refs: Vec<ContentReference> = map.keys().cloned().collect();
        refs.sort();
        refs
    }

    fn get(&self, reference: &ContentReference) -> ReadResult<Arc<[u8]>> {
        let map = self.objects.read().expect("lock poisoned");
        map.get(reference)
            .cloned()
            .ok_or_else(|| ReadError::NotFound(reference.clone()))
    }
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore for InMemoryContentStore {
    fn reader(
        &self,
        reference: &ContentReference,
        range: &ResolvedContentRange,
    ) -> ReadResult<Box<dyn ContentReader>> {
        let data = self.get(reference)?;
        if data.len() as u64 != range.content_size() {
            return Err(ReadError::SizeMismatch {
                reference: reference.clone(),
                expected: range.content_size(),
                actual: data.len() as u64,
            });
        }
        Ok(Box::new(ReadGuard::new(MemoryReader {
            reference: reference.clone(),
            data,
            range: *range,
        })))
    }

    fn create_writer(&self) -> WriteResult<Box<dyn ContentWriter>> {
        Ok(Box::new(WriteGuard::new(MemoryWriter {
            objects: Arc::clone(&self.objects),
            reference: ContentReference::generate(),
            committed: Arc::new(OnceLock::new()),
        })))
    }

    fn remove(&self, reference: &ContentReference) -> WriteResult<()> {
        let mut map = self.objects.write().expect("lock poisoned");
        if map.remove(reference).is_some() {
            debug!(reference = %reference, "removed in-memory content");
        }
        Ok(())
    }

    fn content_size(&self, reference: &ContentReference) -> ReadResult<u64> {
        Ok(self.get(reference)?.len() as u64)
    }
}

impl std::fmt::Debug for InMemoryContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len();
        f.debug_struct("InMemoryContentStore")
            .field("object_count", &count)
            .finish()
    }
}

struct MemoryReader {
    reference: ContentReference,
    data: Arc<[u8]>,
    range: ResolvedContentRange,
}

impl ContentAccessor for MemoryReader {
    fn reference(&self) -> Result<ContentReference, StateError> {
        Ok(self.reference.clone())
    }

    fn content_size(&self) -> Result<u64, StateError> {
        Ok(self.data.len() as u64)
    }

    fn description(&self) -> String {
        format!("memory {} ({})", self.reference, self.range)
    }
}

impl ContentReader for MemoryReader {
    fn range(&self) -> ResolvedContentRange {
        self.range
    }

    fn content_stream(&self) -> ReadResult<Box<dyn Read + Send>> {
        let full = Cursor::new(Arc::clone(&self.data));
        Ok(Box::new(emulate_range(full, self.range)))
    }
}

struct MemoryWriter {
    objects: Arc<RwLock<ObjectMap>>,
    reference: ContentReference,
    committed: Arc<OnceLock<u64>>,
}

impl ContentAccessor for MemoryWriter {
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
        format!("memory writer {}", self.reference)
    }
}

impl ContentWriter for MemoryWriter {
    fn content_sink(&self) -> WriteResult<Box<dyn ContentSink>> {
        Ok(Box::new(MemorySink {
            buf: CountingWriter::new(Vec::new()),
            objects: Arc::clone(&self.objects),
            reference: self.reference.clone(),
            committed: Arc::clone(&self.committed),
        }))
    }
}

struct MemorySink {
    buf: CountingWriter<Vec<u8>>,
    objects: Arc<RwLock<ObjectMap>>,
    reference: ContentReference,
    committed: Arc<OnceLock<u64>>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ContentSink for MemorySink {
    fn finish(self: Box<Self>) -> WriteResult<()> {
        let MemorySink {
            buf,
            objects,
            reference,
            committed,
        } = *self;
        let size = buf.bytes_written();
        let data: Arc<[u8]> = buf.into_inner().into();
        objects
            .write()
            .expect("lock poisoned")
            .insert(reference.clone(), data);
        let _ = committed.set(size);
        debug!(reference = %reference, size, "stored in-memory content");
        Ok(())
    }
}
