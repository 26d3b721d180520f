//! Single-use enforcement for readers and writers.
//!
//! Backends implement the raw read/write behaviour and wrap their handles in
//! [`ReadGuard`] / [`WriteGuard`] before returning them. The guards never
//! alter the bytes of the decorated stream.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coffer_types::{ContentReference, ResolvedContentRange};

use crate::error::{ReadResult, StateError, WriteResult};
use crate::traits::{ContentAccessor, ContentReader, ContentSink, ContentWriter};

/// Atomically flip `flag` from `false` to `true`. Returns `false` if it was
/// already set.
fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Lets the content stream of a reader be taken at most once.
pub struct ReadGuard<R> {
    inner: R,
    used: AtomicBool,
}

impl<R: ContentReader> ReadGuard<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            used: AtomicBool::new(false),
        }
    }
}

impl<R: ContentReader> ContentAccessor for ReadGuard<R> {
    fn reference(&self) -> Result<ContentReference, StateError> {
        self.inner.reference()
    }

    fn content_size(&self) -> Result<u64, StateError> {
        self.inner.content_size()
    }

    fn description(&self) -> String {
        self.inner.description()
    }
}

impl<R: ContentReader> ContentReader for ReadGuard<R> {
    fn range(&self) -> ResolvedContentRange {
        self.inner.range()
    }

    fn content_stream(&self) -> ReadResult<Box<dyn Read + Send>> {
        if !claim(&self.used) {
            return Err(StateError::StreamAlreadyTaken(self.inner.reference()?).into());
        }
        self.inner.content_stream()
    }
}

/// Lets the sink of a writer be opened at most once, and hides the writer's
/// reference and size until that sink has been finished.
pub struct WriteGuard<W> {
    inner: W,
    opened: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl<W: ContentWriter> WriteGuard<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            opened: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_closed(&self) -> Result<(), StateError> {
        if self.closed.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StateError::NotClosed {
                description: self.inner.description(),
            })
        }
    }
}

impl<W: ContentWriter> ContentAccessor for WriteGuard<W> {
    fn reference(&self) -> Result<ContentReference, StateError> {
        self.ensure_closed()?;
        self.inner.reference()
    }

    fn content_size(&self) -> Result<u64, StateError> {
        self.ensure_closed()?;
        self.inner.content_size()
    }

    fn description(&self) -> String {
        self.inner.description()
    }
}

impl<W: ContentWriter> ContentWriter for WriteGuard<W> {
    fn content_sink(&self) -> WriteResult<Box<dyn ContentSink>> {
        if !claim(&self.opened) {
            return Err(StateError::SinkAlreadyOpened {
                description: self.inner.description(),
            }
            .into());
        }
        let inner = self.inner.content_sink()?;
        Ok(Box::new(GuardedSink {
            inner,
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Marks its writer closed once the wrapped sink finishes successfully.
struct GuardedSink {
    inner: Box<dyn ContentSink>,
    closed: Arc<AtomicBool>,
}

impl Write for GuardedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ContentSink for GuardedSink {
    fn finish(self: Box<Self>) -> WriteResult<()> {
        let GuardedSink { inner, closed } = *self;
        inner.finish()?;
        closed.store(true, Ordering::Release);
        Ok(())
    }
}
