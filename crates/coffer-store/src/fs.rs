//! Filesystem-backed content store.
//!
//! Each object is one file named after its reference directly under the
//! store root. Writes go to a temporary file in the same directory and are
//! renamed into place when the sink finishes, so a reader never observes a
//! partially written object and an abandoned write leaves nothing behind.
//! Temporary files are named with a prefix outside the reference alphabet,
//! so no reference can address one.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use coffer_types::{ContentReference, ResolvedContentRange};
use tempfile::{Builder, NamedTempFile};
use tracing::debug;

use crate::error::{ReadError, ReadResult, StateError, WriteError, WriteResult};
use crate::guard::{ReadGuard, WriteGuard};
use crate::stream::{CountingWriter, RangeWindowReader};
use crate::traits::{ContentAccessor, ContentReader, ContentSink, ContentStore, ContentWriter};

/// Prefix of in-flight write files. `~` is not a valid reference character.
const STAGING_PREFIX: &str = "~tmp";

/// Content store keeping one file per object under a root directory.
#[derive(Debug, Clone)]
pub struct FileSystemContentStore {
    root: PathBuf,
}

impl FileSystemContentStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, reference: &ContentReference) -> PathBuf {
        self.root.join(reference.as_str())
    }

    fn stored_size(&self, reference: &ContentReference) -> ReadResult<u64> {
        match fs::metadata(self.path_for(reference)) {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(ReadError::NotFound(reference.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ReadError::NotFound(reference.clone()))
            }
            Err(e) => Err(ReadError::io(reference, e)),
        }
    }
}

impl ContentStore for FileSystemContentStore {
    fn reader(
        &self,
        reference: &ContentReference,
        range: &ResolvedContentRange,
    ) -> ReadResult<Box<dyn ContentReader>> {
        let actual = self.stored_size(reference)?;
        if actual != range.content_size() {
            return Err(ReadError::SizeMismatch {
                reference: reference.clone(),
                expected: range.content_size(),
                actual,
            });
        }
        debug!(reference = %reference, range = %range, "opening file reader");
        Ok(Box::new(ReadGuard::new(FileReader {
            reference: reference.clone(),
            path: self.path_for(reference),
            range: *range,
        })))
    }

    fn create_writer(&self) -> WriteResult<Box<dyn ContentWriter>> {
        Ok(Box::new(WriteGuard::new(FileWriter {
            root: self.root.clone(),
            reference: ContentReference::generate(),
            committed: Arc::new(OnceLock::new()),
        })))
    }

    fn remove(&self, reference: &ContentReference) -> WriteResult<()> {
        match fs::remove_file(self.path_for(reference)) {
            Ok(()) => {
                debug!(reference = %reference, "removed content file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(reference = %reference, "content file already absent");
                Ok(())
            }
            Err(e) => Err(WriteError::io(Some(reference), e)),
        }
    }

    fn content_size(&self, reference: &ContentReference) -> ReadResult<u64> {
        self.stored_size(reference)
    }
}

struct FileReader {
    reference: ContentReference,
    path: PathBuf,
    range: ResolvedContentRange,
}

impl ContentAccessor for FileReader {
    fn reference(&self) -> Result<ContentReference, StateError> {
        Ok(self.reference.clone())
    }

    fn content_size(&self) -> Result<u64, StateError> {
        Ok(self.range.content_size())
    }

    fn description(&self) -> String {
        format!("file {} ({})", self.path.display(), self.range)
    }
}

impl ContentReader for FileReader {
    fn range(&self) -> ResolvedContentRange {
        self.range
    }

    fn content_stream(&self) -> ReadResult<Box<dyn Read + Send>> {
        let open = || -> io::Result<File> {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(self.range.start()))?;
            Ok(file)
        };
        let file = open().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ReadError::NotFound(self.reference.clone()),
            _ => ReadError::io(&self.reference, e),
        })?;
        let positioned = BufReader::new(file).take(self.range.range_size());
        Ok(Box::new(RangeWindowReader::new(positioned, self.range)))
    }
}

struct FileWriter {
    root: PathBuf,
    reference: ContentReference,
    committed: Arc<OnceLock<u64>>,
}

impl ContentAccessor for FileWriter {
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
        format!("file writer in {}", self.root.display())
    }
}

impl ContentWriter for FileWriter {
    fn content_sink(&self) -> WriteResult<Box<dyn ContentSink>> {
        let temp = Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&self.root)
            .map_err(|e| WriteError::io(None, e))?;
        Ok(Box::new(FileSink {
            out: CountingWriter::new(BufWriter::new(temp)),
            target: self.root.join(self.reference.as_str()),
            reference: self.reference.clone(),
            committed: Arc::clone(&self.committed),
        }))
    }
}

struct FileSink {
    out: CountingWriter<BufWriter<NamedTempFile>>,
    target: PathBuf,
    reference: ContentReference,
    committed: Arc<OnceLock<u64>>,
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl ContentSink for FileSink {
    fn finish(self: Box<Self>) -> WriteResult<()> {
        let FileSink {
            out,
            target,
            reference,
            committed,
        } = *self;
        let size = out.bytes_written();
        let fail = |e: io::Error| WriteError::io(Some(&reference), e);

        let temp = out.into_inner().into_inner().map_err(|e| fail(e.into_error()))?;
        temp.as_file().sync_all().map_err(fail)?;
        // No-clobber: a reference collision fails the write instead of
        // overwriting another object.
        temp.persist_noclobber(&target).map_err(|e| fail(e.error))?;

        let _ = committed.set(size);
        debug!(reference = %reference, size, "committed content file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::read_range_to_vec;

    fn store() -> (tempfile::TempDir, FileSystemContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemContentStore::open(dir.path().join("content")).unwrap();
        (dir, store)
    }

    fn put(store: &FileSystemContentStore, data: &[u8]) -> ContentReference {
        let writer = store.write_content(&mut &data[..]).unwrap();
        writer.reference().unwrap()
    }

    #[test]
    fn write_then_read_full() {
        let (_dir, store) = store();
        let r = put(&store, b"hello filesystem");
        assert_eq!(store.content_size(&r).unwrap(), 16);

        let range = ResolvedContentRange::full(16).unwrap();
        let reader = store.reader(&r, &range).unwrap();
        assert_eq!(read_range_to_vec(reader.as_ref()).unwrap(), b"hello filesystem");
    }

    #[test]
    fn ranged_read_is_anchored_at_zero() {
        let (_dir, store) = store();
        let r = put(&store, b"0123456789");
        let range = ResolvedContentRange::new(3, 5, 10).unwrap();
        let reader = store.reader(&r, &range).unwrap();
        let mut all = Vec::new();
        reader.content_stream().unwrap().read_to_end(&mut all).unwrap();
        assert_eq!(all, b"\0\0\0345\0\0\0\0");
    }

    #[test]
    fn writer_reports_size_after_finish() {
        let (_dir, store) = store();
        let writer = store.create_writer().unwrap();
        let mut sink = writer.content_sink().unwrap();
        sink.write_all(b"abc").unwrap();
        assert!(writer.content_size().is_err());
        sink.finish().unwrap();
        assert_eq!(writer.content_size().unwrap(), 3);
    }

    #[test]
    fn abandoned_writer_leaves_nothing() {
        let (_dir, store) = store();
        let writer = store.create_writer().unwrap();
        {
            let mut sink = writer.content_sink().unwrap();
            sink.write_all(b"partial").unwrap();
        }
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 0);
    }

    #[test]
    fn in_flight_write_is_not_addressable() {
        let (_dir, store) = store();
        let writer = store.create_writer().unwrap();
        let mut sink = writer.content_sink().unwrap();
        sink.write_all(b"in flight").unwrap();
        sink.flush().unwrap();

        let names: Vec<String> = fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(STAGING_PREFIX));
        assert!(ContentReference::parse(&names[0]).is_err());

        sink.finish().unwrap();
        let r = writer.reference().unwrap();
        assert_eq!(store.content_size(&r).unwrap(), 9);
    }

    #[test]
    fn unopened_writer_is_harmless() {
        let (_dir, store) = store();
        let writer = store.create_writer().unwrap();
        drop(writer);
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 0);
    }

    #[test]
    fn missing_content_is_not_found() {
        let (_dir, store) = store();
        let r = ContentReference::generate();
        let range = ResolvedContentRange::full(1).unwrap();
        assert!(matches!(
            store.reader(&r, &range).err().unwrap(),
            ReadError::NotFound(_)
        ));
        assert!(matches!(
            store.content_size(&r).unwrap_err(),
            ReadError::NotFound(_)
        ));
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let (_dir, store) = store();
        let r = put(&store, b"four");
        let range = ResolvedContentRange::full(5).unwrap();
        match store.reader(&r, &range).err().unwrap() {
            ReadError::SizeMismatch {
                expected, actual, ..
            } => assert_eq!((expected, actual), (5, 4)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = store();
        let r = put(&store, b"gone soon");
        store.remove(&r).unwrap();
        store.remove(&r).unwrap();
        assert!(store.content_size(&r).is_err());
    }

    #[test]
    fn empty_content_can_be_written() {
        let (_dir, store) = store();
        let r = put(&store, b"");
        assert_eq!(store.content_size(&r).unwrap(), 0);
    }
}
