use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Maximum length of a reference string.
pub const MAX_REFERENCE_LEN: usize = 128;

/// Opaque handle to one stored object.
///
/// A `ContentReference` is assigned by the backend when a write completes and
/// is immutable thereafter. Equality is by value. Fresh references are random
/// UUID v4 strings; collisions with existing objects are not checked.
///
/// References are restricted to `[A-Za-z0-9._-]` so that backends may use
/// them directly as file names or object keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentReference(String);

impl ContentReference {
    /// Generate a fresh random reference.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Parse and validate a reference string.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.is_empty() {
            return Err(TypeError::InvalidReference(s.into(), "empty"));
        }
        if s.len() > MAX_REFERENCE_LEN {
            return Err(TypeError::InvalidReference(s.into(), "too long"));
        }
        if s == "." || s == ".." {
            return Err(TypeError::InvalidReference(s.into(), "reserved name"));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        {
            return Err(TypeError::InvalidReference(
                s.into(),
                "contains characters outside [A-Za-z0-9._-]",
            ));
        }
        Ok(Self(s.to_string()))
    }

    /// The reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentReference({})", self.0)
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentReference {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentReference {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentReference> for String {
    fn from(value: ContentReference) -> Self {
        value.0
    }
}
