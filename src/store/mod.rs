//! storage seams: the local key-value cache and the authoritative
//! backing store, plus the read-through object store that ties them.

mod memory;
mod object;
mod sled_store;

pub use memory::MemoryLocalStore;
pub use object::{ObjectStore, METADATA_CACHE_SIZE};
pub use sled_store::{OpenMode, SledLocalStore};

use crate::error::Result;
use crate::hash::Hash;
use crate::types::{Blob, Tree};

/// named partitions of the local store, each with its own tuning
///
/// no range scans are ever performed in any key space; every access is a
/// point lookup by content hash or inode number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// blob bodies, tuned for large values
    Blob,
    /// 28-byte blob metadata records
    BlobMetadata,
    /// serialized trees
    Tree,
    /// commit hash to root tree hash mapping, populated by the importer
    CommitToTree,
    /// auxiliary records private to the importer
    Aux,
}

impl KeySpace {
    pub const ALL: [KeySpace; 5] = [
        KeySpace::Blob,
        KeySpace::BlobMetadata,
        KeySpace::Tree,
        KeySpace::CommitToTree,
        KeySpace::Aux,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KeySpace::Blob => "blob",
            KeySpace::BlobMetadata => "blob_metadata",
            KeySpace::Tree => "tree",
            KeySpace::CommitToTree => "commit_to_tree",
            KeySpace::Aux => "aux",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            KeySpace::Blob => 0,
            KeySpace::BlobMetadata => 1,
            KeySpace::Tree => 2,
            KeySpace::CommitToTree => 3,
            KeySpace::Aux => 4,
        }
    }
}

/// a buffered multi-put into the local store
///
/// batches must be flushed; dropping a batch with pending writes logs a
/// loud error and discards them.
pub trait WriteBatch {
    fn put(&mut self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()>;

    /// write out pending puts; a no-op on an empty batch
    fn flush(&mut self) -> Result<()>;
}

/// durable local cache of immutable objects, shared across mounts
///
/// absence is `Ok(None)`, never an error; only transport-level failures
/// surface as `Err`.
pub trait LocalStore: Send + Sync {
    fn get(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// point lookups for many keys; results preserve caller order
    fn get_batch(&self, space: KeySpace, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>>;

    fn has_key(&self, space: KeySpace, key: &[u8]) -> Result<bool>;

    fn put(&self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()>;

    /// begin a buffered write; with `buffer_bytes > 0` the batch
    /// auto-flushes once its buffered size crosses the threshold
    fn begin_write(&self, buffer_bytes: usize) -> Result<Box<dyn WriteBatch + '_>>;

    fn clear_space(&self, space: KeySpace) -> Result<()>;

    fn compact_space(&self, space: KeySpace) -> Result<()>;

    fn approximate_size(&self, space: KeySpace) -> Result<u64>;
}

/// authoritative, possibly remote source of trees and blobs
///
/// implementations resolve objects by content hash only; a missing object
/// is `Ok(None)` so the object store can distinguish absence from
/// transport failure.
pub trait BackingStore: Send + Sync {
    fn get_tree(&self, hash: &Hash) -> Result<Option<Tree>>;

    fn get_blob(&self, hash: &Hash) -> Result<Option<Blob>>;

    /// resolve a commit to its root tree
    fn get_tree_for_commit(&self, commit: &Hash) -> Result<Option<Tree>>;

    /// hint that these blobs will be wanted soon; may be a no-op
    fn prefetch_blobs(&self, _hashes: &[Hash]) -> Result<()> {
        Ok(())
    }
}
