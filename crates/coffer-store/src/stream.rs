//! Stream adapters used to present ranged content.
//!
//! Every reader hands out a stream anchored at logical offset 0 of the
//! content. Backends that can seek or issue ranged requests position their
//! delegate at the range start natively; the others wrap the full content in
//! [`emulate_range`], which skips lazily. Either way the delegate ends up
//! inside a [`RangeWindowReader`] that zero-fills everything outside the
//! requested range.

use std::io::{self, Read, Write};

use coffer_types::ResolvedContentRange;

use crate::error::{ReadError, ReadResult};
use crate::traits::ContentReader;

const SCRATCH_LEN: usize = 8192;

/// Read and discard exactly `len` bytes.
pub fn skip_exact<R: Read + ?Sized>(reader: &mut R, mut len: u64) -> io::Result<()> {
    let mut buffer = [0u8; SCRATCH_LEN];

    while len > 0 {
        let to_read = std::cmp::min(len, buffer.len() as u64) as usize;
        let read = match reader.read(&mut buffer[..to_read]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended while skipping",
            ));
        }
        len -= read as u64;
    }

    Ok(())
}

/// Read and discard up to `len` bytes, stopping early at end of stream.
/// Returns the number of bytes skipped.
fn skip_up_to<R: Read + ?Sized>(reader: &mut R, len: u64) -> io::Result<u64> {
    io::copy(&mut reader.take(len), &mut io::sink())
}

/// Take the stream of `reader`, skip to the start of its range and collect
/// exactly the bytes of the range.
pub fn read_range_to_vec(reader: &dyn ContentReader) -> ReadResult<Vec<u8>> {
    let range = reader.range();
    let reference = reader.reference()?;
    let mut stream = reader.content_stream()?;
    skip_exact(&mut stream, range.start()).map_err(|e| ReadError::io(&reference, e))?;

    let mut out = Vec::with_capacity(range.range_size().min(1 << 20) as usize);
    stream
        .take(range.range_size())
        .read_to_end(&mut out)
        .map_err(|e| ReadError::io(&reference, e))?;
    if out.len() as u64 != range.range_size() {
        return Err(ReadError::io(
            &reference,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, got {}", range.range_size(), out.len()),
            ),
        ));
    }
    Ok(out)
}

/// Wrap a stream over the full content so that it presents only `range`.
pub fn emulate_range<R: Read>(
    full_content: R,
    range: ResolvedContentRange,
) -> RangeWindowReader<LazySkipReader<R>> {
    RangeWindowReader::new(LazySkipReader::new(full_content, range.start()), range)
}

// ---------------------------------------------------------------------------
// LazySkipReader
// ---------------------------------------------------------------------------

/// Skips a fixed number of delegate bytes, but only on the first read or
/// skip call, never at construction.
pub struct LazySkipReader<R> {
    inner: R,
    pending: u64,
}

impl<R: Read> LazySkipReader<R> {
    pub fn new(inner: R, skip: u64) -> Self {
        Self {
            inner,
            pending: skip,
        }
    }

    /// Bytes still to be skipped before the first delegate read.
    pub fn pending_skip(&self) -> u64 {
        self.pending
    }

    fn settle(&mut self) -> io::Result<()> {
        if self.pending > 0 {
            let n = std::mem::take(&mut self.pending);
            skip_exact(&mut self.inner, n)?;
        }
        Ok(())
    }

    /// Skip `n` bytes past the initial offset.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.settle()?;
        skip_up_to(&mut self.inner, n)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for LazySkipReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.settle()?;
        self.inner.read(buf)
    }
}

// ---------------------------------------------------------------------------
// ZeroPrefixReader
// ---------------------------------------------------------------------------

/// Emits `prefix` zero bytes before the delegate's bytes.
pub struct ZeroPrefixReader<R> {
    inner: R,
    remaining_zeros: u64,
}

impl<R: Read> ZeroPrefixReader<R> {
    pub fn new(inner: R, prefix: u64) -> Self {
        Self {
            inner,
            remaining_zeros: prefix,
        }
    }
}

impl<R: Read> Read for ZeroPrefixReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining_zeros == 0 {
            return self.inner.read(buf);
        }
        let n = std::cmp::min(buf.len() as u64, self.remaining_zeros) as usize;
        buf[..n].fill(0);
        self.remaining_zeros -= n as u64;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// RangeWindowReader
// ---------------------------------------------------------------------------

/// Where a request `[position, position + n)` falls relative to the range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Span {
    /// Entirely before the range: `n` zero bytes.
    Before(u64),
    /// Starts before the range and reaches into it: zeros up to the start.
    IntoRange(u64),
    /// Starts inside the range: up to this many delegate bytes.
    Inside(u64),
    /// Entirely after the range: `n` zero bytes.
    After(u64),
}

/// Logical-position-preserving filter over a delegate positioned at the
/// range start.
///
/// The stream is `content_size` bytes long. Positions before `start` and
/// after `end_inclusive` read as zero without touching the delegate; the
/// delegate is consulted only for positions inside the range.
pub struct RangeWindowReader<R> {
    inner: R,
    range: ResolvedContentRange,
    position: u64,
}

impl<R: Read> RangeWindowReader<R> {
    pub fn new(inner: R, range: ResolvedContentRange) -> Self {
        Self {
            inner,
            range,
            position: 0,
        }
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left before the end of the logical content.
    pub fn available(&self) -> u64 {
        self.range.content_size().saturating_sub(self.position)
    }

    fn classify(&self, requested: u64) -> Span {
        let n = requested.min(self.available());
        let start = self.range.start();
        let end = self.range.end_inclusive();
        // Saturating: `position + n` must not wrap for huge requests.
        let stop = self.position.saturating_add(n);

        if self.position > end {
            Span::After(n)
        } else if stop <= start {
            Span::Before(n)
        } else if self.position < start {
            Span::IntoRange(start - self.position)
        } else {
            Span::Inside(n.min(end - self.position + 1))
        }
    }

    fn truncated(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "content ended at logical offset {} inside {}",
                self.position, self.range
            ),
        )
    }

    /// Skip `n` logical bytes, consulting the delegate only for the part of
    /// the skip that lies inside the range.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            let step = match self.classify(n - skipped) {
                Span::Before(k) | Span::IntoRange(k) | Span::After(k) => k,
                Span::Inside(k) => {
                    let done = skip_up_to(&mut self.inner, k)?;
                    if done < k {
                        self.position += done;
                        return Err(self.truncated());
                    }
                    k
                }
            };
            if step == 0 {
                break;
            }
            self.position += step;
            skipped += step;
        }
        Ok(skipped)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for RangeWindowReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.classify(buf.len() as u64) {
            Span::Before(n) | Span::IntoRange(n) | Span::After(n) => {
                let n = n as usize;
                buf[..n].fill(0);
                self.position += n as u64;
                Ok(n)
            }
            Span::Inside(n) => {
                let read = self.inner.read(&mut buf[..n as usize])?;
                if read == 0 && n > 0 {
                    return Err(self.truncated());
                }
                self.position += read as u64;
                Ok(read)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Byte counters
// ---------------------------------------------------------------------------

/// Counts the bytes read through it.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn bytes_read(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Counts the bytes written through it.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.count
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
