//! Content store contracts and storage backends for Coffer.
//!
//! A content store keeps opaque byte objects under backend-assigned
//! [`ContentReference`](coffer_types::ContentReference)s and serves byte
//! ranges of them. Stores compose: the encrypting store in `coffer-vault`
//! implements [`ContentStore`] over another [`ContentStore`].
//!
//! # Backends
//!
//! - [`FileSystemContentStore`] -- one file per object, native seeking
//! - [`InMemoryContentStore`] -- `HashMap`-based store for tests and embedding
//! - [`ObjectContentStore`] -- an object-storage service behind
//!   [`ObjectStorageClient`], native ranged GET
//!
//! # Rules
//!
//! 1. Readers and writers are single-use; [`ReadGuard`] and [`WriteGuard`]
//!    enforce it for every backend.
//! 2. A reader's stream is anchored at offset 0 of the content and spans its
//!    full size; positions outside the range read as zero.
//! 3. A writer's reference and size become available once its sink finishes.
//! 4. An unfinished sink commits nothing.

pub mod error;
pub mod fs;
pub mod guard;
pub mod memory;
pub mod object;
pub mod stream;
pub mod traits;

pub use error::{
    BoxError, ReadError, ReadResult, StateError, UndecryptableError, UnencryptableError,
    WriteError, WriteResult,
};
pub use fs::FileSystemContentStore;
pub use guard::{ReadGuard, WriteGuard};
pub use memory::InMemoryContentStore;
pub use object::{InMemoryObjectStorage, ObjectContentStore, ObjectStorageClient};
pub use stream::{
    emulate_range, read_range_to_vec, skip_exact, CountingReader, CountingWriter,
    LazySkipReader, RangeWindowReader, ZeroPrefixReader,
};
pub use traits::{ContentAccessor, ContentReader, ContentSink, ContentStore, ContentWriter};
