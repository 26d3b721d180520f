//! Owned secret key bytes with explicit, tracked destruction.
//!
//! [`KeyBytes`] owns one buffer and remembers every [`KeyCopy`] it hands
//! out. Destroying the owner zeroes its buffer and every live copy, and
//! records where destruction happened so later misuse reports the call
//! site. Dropping the owner has the same effect.

use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoResult, KeyError};

type SharedBytes = Mutex<Zeroizing<Vec<u8>>>;
type DestroyedAt = Arc<OnceLock<&'static Location<'static>>>;

/// Owner of secret key bytes.
pub struct KeyBytes {
    bytes: Zeroizing<Vec<u8>>,
    len: usize,
    issued: Mutex<Vec<Weak<SharedBytes>>>,
    destroyed_at: DestroyedAt,
}

impl KeyBytes {
    /// Take ownership of `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            bytes: Zeroizing::new(bytes),
            len,
            issued: Mutex::new(Vec::new()),
            destroyed_at: Arc::new(OnceLock::new()),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    /// `len` bytes from the operating system's CSPRNG.
    pub fn random(len: usize) -> CryptoResult<Self> {
        let mut bytes = vec![0u8; len];
        if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
            bytes.zeroize();
            return Err(KeyError::Rng(e.to_string()));
        }
        Ok(Self::new(bytes))
    }

    /// Length of the key as created. Unchanged by destruction.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed_at.get().is_some()
    }

    /// Where [`destroy`](Self::destroy) was called, if it was.
    pub fn destroyed_at(&self) -> Option<&'static Location<'static>> {
        self.destroyed_at.get().copied()
    }

    fn ensure_live(&self) -> CryptoResult<()> {
        match self.destroyed_at.get() {
            Some(&destroyed_at) => Err(KeyError::Destroyed { destroyed_at }),
            None => Ok(()),
        }
    }

    /// Borrow the key bytes.
    pub fn expose(&self) -> CryptoResult<&[u8]> {
        self.ensure_live()?;
        Ok(self.bytes.as_slice())
    }

    /// Issue a copy that this owner will wipe when it is destroyed.
    pub fn copy(&self) -> CryptoResult<KeyCopy> {
        self.ensure_live()?;
        let shared = Arc::new(Mutex::new(Zeroizing::new(self.bytes.to_vec())));
        let mut issued = self.issued.lock().expect("lock poisoned");
        issued.retain(|weak| weak.strong_count() > 0);
        issued.push(Arc::downgrade(&shared));
        Ok(KeyCopy {
            bytes: shared,
            destroyed_at: Arc::clone(&self.destroyed_at),
        })
    }

    /// An independent owner of the same bytes, with its own lifecycle.
    pub fn duplicate(&self) -> CryptoResult<KeyBytes> {
        Ok(KeyBytes::from_slice(self.expose()?))
    }

    /// Zero the key and every issued copy. Idempotent; the first call site
    /// is the one reported afterwards.
    #[track_caller]
    pub fn destroy(&mut self) {
        self.wipe(Location::caller());
    }

    fn wipe(&mut self, at: &'static Location<'static>) {
        if self.destroyed_at.set(at).is_err() {
            return;
        }
        self.bytes.zeroize();
        let issued = std::mem::take(&mut *self.issued.lock().expect("lock poisoned"));
        for copy in issued.iter().filter_map(Weak::upgrade) {
            copy.lock().expect("lock poisoned").zeroize();
        }
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.wipe(Location::caller());
    }
}

impl fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBytes")
            .field("len", &self.len)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// A copy of key bytes issued by, and wiped together with, a [`KeyBytes`].
pub struct KeyCopy {
    bytes: Arc<SharedBytes>,
    destroyed_at: DestroyedAt,
}

impl KeyCopy {
    /// Run `f` over the bytes, or fail if the owner has been destroyed.
    pub fn with_bytes<T>(&self, f: impl FnOnce(&[u8]) -> T) -> CryptoResult<T> {
        let bytes = self.bytes.lock().expect("lock poisoned");
        // Checked under the lock: the owner sets the flag before wiping.
        if let Some(&destroyed_at) = self.destroyed_at.get() {
            return Err(KeyError::Destroyed { destroyed_at });
        }
        Ok(f(bytes.as_slice()))
    }
}

impl fmt::Debug for KeyCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCopy")
            .field("destroyed", &self.destroyed_at.get().is_some())
            .finish_non_exhaustive()
    }
}
