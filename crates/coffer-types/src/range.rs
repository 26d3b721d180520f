//! Byte-range requests and their resolution against a known content size.
//!
//! A [`ContentRangeRequest`] is what a client asks for; it may be open-ended
//! or expressed as a suffix. Resolving it against the content size yields a
//! [`ResolvedContentRange`] with both ends fixed and inclusive.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RangeError, TypeError};

/// A client-specified byte range, before the content size is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRangeRequest")]
pub enum ContentRangeRequest {
    /// Bytes from `start` up to `end_inclusive`, or to the end of the content.
    FromStart {
        start: u64,
        end_inclusive: Option<u64>,
    },
    /// The last `length` bytes of the content.
    Suffix { length: u64 },
}

impl ContentRangeRequest {
    /// A start-based request. Fails if `end_inclusive < start`.
    pub fn from_start(start: u64, end_inclusive: Option<u64>) -> Result<Self, RangeError> {
        if let Some(end) = end_inclusive {
            if end < start {
                return Err(RangeError::Inverted { start, end });
            }
        }
        Ok(Self::FromStart {
            start,
            end_inclusive,
        })
    }

    /// A request for the last `length` bytes.
    pub fn suffix(length: u64) -> Self {
        Self::Suffix { length }
    }

    /// A request for the whole content.
    pub fn full() -> Self {
        Self::FromStart {
            start: 0,
            end_inclusive: None,
        }
    }

    /// Resolve this request against a content size.
    ///
    /// Start-based requests fail when `start >= content_size`; an end beyond
    /// the content is clamped to the last byte. Suffix requests clamp to the
    /// full content when `length >= content_size`. Empty content has no
    /// satisfiable range, and neither does a zero-length suffix.
    pub fn resolve(&self, content_size: u64) -> Result<ResolvedContentRange, RangeError> {
        match *self {
            Self::FromStart {
                start,
                end_inclusive,
            } => {
                if start >= content_size {
                    return Err(RangeError::Unsatisfiable {
                        start,
                        content_size,
                    });
                }
                let last = content_size - 1;
                let end = end_inclusive.map_or(last, |end| end.min(last));
                ResolvedContentRange::new(start, end, content_size)
            }
            Self::Suffix { length } => {
                if content_size == 0 || length == 0 {
                    return Err(RangeError::Unsatisfiable {
                        start: content_size,
                        content_size,
                    });
                }
                let start = content_size.saturating_sub(length);
                ResolvedContentRange::new(start, content_size - 1, content_size)
            }
        }
    }
}

/// Parses a single-range HTTP `Range` header value:
/// `bytes=<start>-<end>`, `bytes=<start>-` or `bytes=-<length>`.
impl FromStr for ContentRangeRequest {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| TypeError::MalformedRange {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let spec = s
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| malformed("expected `bytes=` unit"))?;
        if spec.contains(',') {
            return Err(malformed("multiple ranges are not supported"));
        }
        let (first, last) = spec
            .split_once('-')
            .ok_or_else(|| malformed("missing `-` separator"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| malformed("bound is not a non-negative integer"))
        };
        match (first.trim().is_empty(), last.trim().is_empty()) {
            (true, true) => Err(malformed("both bounds are empty")),
            (true, false) => Ok(Self::suffix(parse(last)?)),
            (false, true) => Ok(Self::FromStart {
                start: parse(first)?,
                end_inclusive: None,
            }),
            (false, false) => Self::from_start(parse(first)?, Some(parse(last)?))
                .map_err(|e| malformed(&e.to_string())),
        }
    }
}

/// Unvalidated wire form of [`ContentRangeRequest`].
#[derive(Deserialize)]
enum RawRangeRequest {
    FromStart {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        length: u64,
    },
}

impl TryFrom<RawRangeRequest> for ContentRangeRequest {
    type Error = RangeError;

    fn try_from(raw: RawRangeRequest) -> Result<Self, Self::Error> {
        match raw {
            RawRangeRequest::FromStart {
                start,
                end_inclusive,
            } => Self::from_start(start, end_inclusive),
            RawRangeRequest::Suffix { length } => Ok(Self::suffix(length)),
        }
    }
}

/// A byte range anchored to a known content size.
///
/// Invariant: `start <= end_inclusive < content_size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawResolvedRange")]
pub struct ResolvedContentRange {
    start: u64,
    end_inclusive: u64,
    content_size: u64,
}

#[derive(Deserialize)]
struct RawResolvedRange {
    start: u64,
    end_inclusive: u64,
    content_size: u64,
}

impl TryFrom<RawResolvedRange> for ResolvedContentRange {
    type Error = RangeError;

    fn try_from(raw: RawResolvedRange) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end_inclusive, raw.content_size)
    }
}

impl ResolvedContentRange {
    /// Build a resolved range, validating its bounds.
    pub fn new(start: u64, end_inclusive: u64, content_size: u64) -> Result<Self, RangeError> {
        if end_inclusive < start {
            return Err(RangeError::Inverted {
                start,
                end: end_inclusive,
            });
        }
        if start >= content_size || end_inclusive >= content_size {
            return Err(RangeError::OutOfBounds {
                start,
                end: end_inclusive,
                content_size,
            });
        }
        Ok(Self {
            start,
            end_inclusive,
            content_size,
        })
    }

    /// The range covering the whole content.
    pub fn full(content_size: u64) -> Result<Self, RangeError> {
        ContentRangeRequest::full().resolve(content_size)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end_inclusive(&self) -> u64 {
        self.end_inclusive
    }

    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    /// Number of bytes in the range.
    pub fn range_size(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }

    /// Returns `true` if the range covers the whole content.
    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end_inclusive + 1 == self.content_size
    }

    /// Returns `true` if the logical offset lies inside the range.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset <= self.end_inclusive
    }

    /// The same range with its start moved down to a multiple of `block_size`.
    pub fn align_start(&self, block_size: u64) -> Self {
        let block_size = block_size.max(1);
        Self {
            start: self.start - self.start % block_size,
            ..*self
        }
    }
}

/// `bytes <start>-<end>/<total>`, the HTTP `Content-Range` form.
impl fmt::Display for ResolvedContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bytes {}-{}/{}",
            self.start, self.end_inclusive, self.content_size
        )
    }
}

/// A parsed `bytes <start>-<end>/<total-or-*>` value.
///
/// An unknown total (`*`) is kept as `None` until resolution, where it is
/// corrected to `end + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRangeHeader {
    pub start: u64,
    pub end_inclusive: u64,
    pub total: Option<u64>,
}

impl ContentRangeHeader {
    /// Convert to a resolved range, substituting `end + 1` for an unknown total.
    pub fn resolve(&self) -> Result<ResolvedContentRange, RangeError> {
        let minimum = self.end_inclusive.saturating_add(1);
        let content_size = self.total.unwrap_or(minimum);
        ResolvedContentRange::new(self.start, self.end_inclusive, content_size)
    }
}

impl FromStr for ContentRangeHeader {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| TypeError::MalformedRange {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let rest = s
            .trim()
            .strip_prefix("bytes ")
            .ok_or_else(|| malformed("expected `bytes ` unit"))?;
        let (span, total) = rest
            .split_once('/')
            .ok_or_else(|| malformed("missing `/` before total"))?;
        let (start, end) = span
            .split_once('-')
            .ok_or_else(|| malformed("missing `-` separator"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| malformed("bound is not a non-negative integer"))
        };
        let total = match total.trim() {
            "*" => None,
            t => Some(parse(t)?),
        };
        Ok(Self {
            start: parse(start)?,
            end_inclusive: parse(end)?,
            total,
        })
    }
}

impl FromStr for ResolvedContentRange {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let header: ContentRangeHeader = s.parse()?;
        header.resolve().map_err(|e| TypeError::MalformedRange {
            input: s.to_string(),
            reason: e.to_string(),
        })
    }
}
