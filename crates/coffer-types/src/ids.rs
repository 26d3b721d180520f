use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a key-encryption key (KEK).
///
/// The empty string is reserved as the "unwrapped" sentinel: a stored data
/// encryption key carrying this id is kept in the clear.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappingKeyId(String);

impl WrappingKeyId {
    /// The sentinel id for keys stored without wrapping.
    pub fn unwrapped() -> Self {
        Self(String::new())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns `true` for the unwrapped sentinel.
    pub fn is_unwrapped(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WrappingKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappingKeyId({self})")
    }
}

impl fmt::Display for WrappingKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unwrapped() {
            f.write_str("<unwrapped>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Name of a content-encryption algorithm, e.g. `aes-ctr`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlgorithmId(String);

impl AlgorithmId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlgorithmId({})", self.0)
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
