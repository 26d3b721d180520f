use thiserror::Error;

/// Errors produced when parsing or validating identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid content reference {0:?}: {1}")]
    InvalidReference(String, &'static str),

    #[error("malformed range {input:?}: {reason}")]
    MalformedRange { input: String, reason: String },
}

/// Errors produced by byte-range resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    /// The requested start lies at or beyond the end of the content.
    ///
    /// Callers should treat this as a client error (HTTP 416), never retry.
    #[error("range starting at byte {start} is not satisfiable for content of {content_size} bytes")]
    Unsatisfiable { start: u64, content_size: u64 },

    /// The bounds do not describe a range inside the content.
    #[error("invalid range {start}-{end} for content of {content_size} bytes")]
    OutOfBounds {
        start: u64,
        end: u64,
        content_size: u64,
    },

    /// The end of the range precedes its start.
    #[error("range end {end} precedes start {start}")]
    Inverted { start: u64, end: u64 },
}
