//! Persistence of stored data encryption keys.
//!
//! There is one row per `(reference, wrapping key id)`. Adding a row for a
//! pair that already has one replaces it.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use coffer_types::{AlgorithmId, ContentReference, WrappingKeyId};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;
use zeroize::Zeroizing;

use crate::dek::StoredDataEncryptionKey;
use crate::error::{AccessorError, AccessorResult};
use crate::keys::KeyBytes;

/// Lookup and persistence of the key rows belonging to content.
pub trait DataEncryptionKeyAccessor: Send + Sync {
    /// All rows stored for `reference`. Empty if there are none.
    fn find_all_keys(
        &self,
        reference: &ContentReference,
    ) -> AccessorResult<Vec<StoredDataEncryptionKey>>;

    fn add_keys(
        &self,
        reference: &ContentReference,
        keys: &[StoredDataEncryptionKey],
    ) -> AccessorResult<()>;

    /// Remove the row wrapped by `wrapping_key_id`. Returns whether one existed.
    fn remove_key(
        &self,
        reference: &ContentReference,
        wrapping_key_id: &WrappingKeyId,
    ) -> AccessorResult<bool>;

    /// Remove every row of `reference`. Succeeds if there are none.
    fn clear_keys(&self, reference: &ContentReference) -> AccessorResult<()>;
}

fn duplicate_all(rows: &[StoredDataEncryptionKey]) -> AccessorResult<Vec<StoredDataEncryptionKey>> {
    rows.iter()
        .map(|row| row.duplicate().map_err(AccessorError::from))
        .collect()
}

fn decode_hex(path: &Path, field: &'static str, text: &str) -> AccessorResult<Vec<u8>> {
    hex::decode(text).map_err(|source| AccessorError::Hex {
        path: path.to_path_buf(),
        field,
        source,
    })
}

fn merge_rows(
    existing: &mut Vec<StoredDataEncryptionKey>,
    added: Vec<StoredDataEncryptionKey>,
) {
    for row in added {
        existing.retain(|r| r.wrapping_key_id() != row.wrapping_key_id());
        existing.push(row);
    }
}

// ---------------------------------------------------------------------------
// InMemoryKeyAccessor
// ---------------------------------------------------------------------------

/// Key rows held in a `HashMap`. Intended for tests and embedding.
#[derive(Default)]
pub struct InMemoryKeyAccessor {
    rows: RwLock<HashMap<ContentReference, Vec<StoredDataEncryptionKey>>>,
}

impl InMemoryKeyAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of references with at least one row.
    pub fn len(&self) -> usize {
        self.rows.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().expect("lock poisoned").is_empty()
    }
}

impl DataEncryptionKeyAccessor for InMemoryKeyAccessor {
    fn find_all_keys(
        &self,
        reference: &ContentReference,
    ) -> AccessorResult<Vec<StoredDataEncryptionKey>> {
        let map = self.rows.read().expect("lock poisoned");
        match map.get(reference) {
            Some(rows) => duplicate_all(rows),
            None => Ok(Vec::new()),
        }
    }

    fn add_keys(
        &self,
        reference: &ContentReference,
        keys: &[StoredDataEncryptionKey],
    ) -> AccessorResult<()> {
        let added = duplicate_all(keys)?;
        let mut map = self.rows.write().expect("lock poisoned");
        merge_rows(map.entry(reference.clone()).or_default(), added);
        Ok(())
    }

    fn remove_key(
        &self,
        reference: &ContentReference,
        wrapping_key_id: &WrappingKeyId,
    ) -> AccessorResult<bool> {
        let mut map = self.rows.write().expect("lock poisoned");
        let Some(rows) = map.get_mut(reference) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|r| r.wrapping_key_id() != wrapping_key_id);
        let removed = rows.len() != before;
        if rows.is_empty() {
            map.remove(reference);
        }
        Ok(removed)
    }

    fn clear_keys(&self, reference: &ContentReference) -> AccessorResult<()> {
        self.rows.write().expect("lock poisoned").remove(reference);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryKeyAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKeyAccessor")
            .field("reference_count", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FileKeyAccessor
// ---------------------------------------------------------------------------

/// On-disk form of one row. Byte fields are hex encoded.
#[derive(Serialize, Deserialize)]
struct KeyRow {
    algorithm: AlgorithmId,
    wrapping_key_id: WrappingKeyId,
    wrapped_key: String,
    iv: String,
}

#[derive(Serialize, Deserialize)]
struct KeyDocument {
    reference: ContentReference,
    keys: Vec<KeyRow>,
}

/// Key rows kept as one JSON document per reference in a directory.
///
/// Documents are replaced atomically through a temporary file. A process
/// wide lock serialises read-modify-write cycles on the same accessor.
#[derive(Debug)]
pub struct FileKeyAccessor {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKeyAccessor {
    /// Open an accessor over `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> AccessorResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| AccessorError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, reference: &ContentReference) -> PathBuf {
        self.dir.join(format!("{reference}.json"))
    }

    fn load(&self, reference: &ContentReference) -> AccessorResult<Vec<StoredDataEncryptionKey>> {
        let path = self.path_for(reference);
        let text = match fs::read_to_string(&path) {
            Ok(text) => Zeroizing::new(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(AccessorError::Io { path, source }),
        };
        let doc: KeyDocument = serde_json::from_str(&text)
            .map_err(|source| AccessorError::Json {
                path: path.clone(),
                source,
            })?;

        doc.keys
            .into_iter()
            .map(|row| -> AccessorResult<StoredDataEncryptionKey> {
                let wrapped = Zeroizing::new(row.wrapped_key);
                Ok(StoredDataEncryptionKey::new(
                    row.algorithm,
                    row.wrapping_key_id,
                    KeyBytes::new(decode_hex(&path, "wrapped_key", &wrapped)?),
                    decode_hex(&path, "iv", &row.iv)?,
                ))
            })
            .collect()
    }

    fn store(
        &self,
        reference: &ContentReference,
        rows: &[StoredDataEncryptionKey],
    ) -> AccessorResult<()> {
        let path = self.path_for(reference);
        if rows.is_empty() {
            return self.delete(&path);
        }

        let keys = rows
            .iter()
            .map(|row| -> AccessorResult<KeyRow> {
                Ok(KeyRow {
                    algorithm: row.algorithm().clone(),
                    wrapping_key_id: row.wrapping_key_id().clone(),
                    wrapped_key: hex::encode(row.wrapped_key()?),
                    iv: hex::encode(row.iv()),
                })
            })
            .collect::<AccessorResult<Vec<_>>>()?;
        let doc = KeyDocument {
            reference: reference.clone(),
            keys,
        };

        let io_err = |source: io::Error| AccessorError::Io {
            path: path.clone(),
            source,
        };
        let temp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        let mut out = BufWriter::new(temp);
        serde_json::to_writer_pretty(&mut out, &doc).map_err(|source| AccessorError::Json {
            path: path.clone(),
            source,
        })?;
        out.flush().map_err(io_err)?;
        let temp = out.into_inner().map_err(|e| io_err(e.into_error()))?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> AccessorResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AccessorError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl DataEncryptionKeyAccessor for FileKeyAccessor {
    fn find_all_keys(
        &self,
        reference: &ContentReference,
    ) -> AccessorResult<Vec<StoredDataEncryptionKey>> {
        self.load(reference)
    }

    fn add_keys(
        &self,
        reference: &ContentReference,
        keys: &[StoredDataEncryptionKey],
    ) -> AccessorResult<()> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let mut rows = self.load(reference)?;
        merge_rows(&mut rows, duplicate_all(keys)?);
        self.store(reference, &rows)?;
        debug!(reference = %reference, rows = rows.len(), "persisted key rows");
        Ok(())
    }

    fn remove_key(
        &self,
        reference: &ContentReference,
        wrapping_key_id: &WrappingKeyId,
    ) -> AccessorResult<bool> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let mut rows = self.load(reference)?;
        let before = rows.len();
        rows.retain(|r| r.wrapping_key_id() != wrapping_key_id);
        if rows.len() == before {
            return Ok(false);
        }
        self.store(reference, &rows)?;
        Ok(true)
    }

    fn clear_keys(&self, reference: &ContentReference) -> AccessorResult<()> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        self.delete(&self.path_for(reference))
    }
}
