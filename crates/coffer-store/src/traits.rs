use std::io::{self, Read, Write};

use coffer_types::{ContentReference, ResolvedContentRange};

use crate::error::{ReadResult, StateError, WriteError, WriteResult};

/// Metadata shared by readers and writers.
pub trait ContentAccessor: Send + Sync {
    /// The reference of the content.
    ///
    /// Readers know it immediately. Writers only know it once their sink has
    /// been finished; before that this returns [`StateError::NotClosed`].
    fn reference(&self) -> Result<ContentReference, StateError>;

    /// Total size of the content in bytes, with the same availability rules
    /// as [`reference`](Self::reference).
    fn content_size(&self) -> Result<u64, StateError>;

    /// Human-readable description for logs and error messages.
    fn description(&self) -> String;
}

/// Read handle for one stored object and one resolved range.
pub trait ContentReader: ContentAccessor {
    /// The range this reader was opened for.
    fn range(&self) -> ResolvedContentRange;

    /// Obtain the content stream. May be called exactly once.
    ///
    /// The stream is anchored at logical offset 0 of the content and spans
    /// `content_size` bytes. Only bytes inside [`range`](Self::range) carry
    /// content; every other position reads as zero. Callers that want just
    /// the range skip to its start themselves (see
    /// [`read_range_to_vec`](crate::stream::read_range_to_vec)).
    fn content_stream(&self) -> ReadResult<Box<dyn Read + Send>>;
}

/// Write handle for one new object.
pub trait ContentWriter: ContentAccessor {
    /// Open the sink receiving the content. May be called exactly once.
    fn content_sink(&self) -> WriteResult<Box<dyn ContentSink>>;
}

/// Output stream of a [`ContentWriter`].
///
/// The content is committed only by [`finish`](Self::finish). Dropping a sink
/// without finishing it abandons the write.
pub trait ContentSink: Write + Send {
    fn finish(self: Box<Self>) -> WriteResult<()>;
}

/// A content storage backend (or a decorator over one).
///
/// Implementations must be thread-safe. Readers created independently for
/// the same reference may be used concurrently; each reader and writer is
/// single-use.
pub trait ContentStore: Send + Sync {
    /// Open a reader for `range` of the content stored under `reference`.
    ///
    /// Fails with [`ReadError::NotFound`](crate::ReadError::NotFound) if the
    /// object is missing and with
    /// [`ReadError::SizeMismatch`](crate::ReadError::SizeMismatch) if its
    /// stored size differs from `range.content_size()`.
    fn reader(
        &self,
        reference: &ContentReference,
        range: &ResolvedContentRange,
    ) -> ReadResult<Box<dyn ContentReader>>;

    /// Create a writer for a new object. The backend assigns its reference.
    fn create_writer(&self) -> WriteResult<Box<dyn ContentWriter>>;

    /// Remove an object. Removing a missing object is not an error.
    fn remove(&self, reference: &ContentReference) -> WriteResult<()>;

    /// Size in bytes of the object stored under `reference`.
    fn content_size(&self, reference: &ContentReference) -> ReadResult<u64>;

    /// Write everything from `source` as a new object and return the closed
    /// writer, whose reference and size are then available.
    fn write_content(&self, source: &mut dyn Read) -> WriteResult<Box<dyn ContentWriter>> {
        let writer = self.create_writer()?;
        let mut sink = writer.content_sink()?;
        io::copy(source, &mut sink).map_err(|e| WriteError::io(None, e))?;
        sink.finish()?;
        Ok(writer)
    }
}
