use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::hash::{sha1_of, Hash};
use crate::stats::{bump, Stats};
use crate::store::{BackingStore, KeySpace, LocalStore};
use crate::types::{Blob, BlobMetadata, Tree};

/// bound on the in-memory blob metadata cache
///
/// each node is a few dozen bytes, so the full cache stays well under
/// 100MB while absorbing the status/diff lookup storm.
pub const METADATA_CACHE_SIZE: usize = 1_000_000;

/// read-through content-addressed store: local key-value cache in front
/// of the authoritative backing store
///
/// multiple mounts may share one ObjectStore; trees and blobs are handed
/// out as shared immutable values.
pub struct ObjectStore {
    local: Arc<dyn LocalStore>,
    backing: Arc<dyn BackingStore>,
    /// guarded by an exclusive lock: cache hits reorder the lru, so a
    /// shared lock is never sufficient
    metadata_cache: Mutex<LruCache<Hash, BlobMetadata>>,
    inflight_trees: DashMap<Hash, Arc<FetchSlot<Tree>>>,
    inflight_blobs: DashMap<Hash, Arc<FetchSlot<Blob>>>,
    stats: Arc<Stats>,
}

/// one in-flight backing fetch; joiners block on the slot until the
/// leader publishes the outcome
struct FetchSlot<T> {
    state: Mutex<Option<FetchOutcome<T>>>,
    cond: Condvar,
}

type FetchOutcome<T> = std::result::Result<Arc<T>, FetchFailure>;

/// cloneable failure so every joiner of a coalesced fetch gets the error
#[derive(Clone)]
enum FetchFailure {
    NotFound(Hash),
    CommitNotFound(Hash),
    Corrupt(Hash),
    Failed(String),
}

impl FetchFailure {
    fn from_error(err: Error) -> Self {
        match err {
            Error::ObjectNotFound(h) => FetchFailure::NotFound(h),
            Error::CommitNotFound(h) => FetchFailure::CommitNotFound(h),
            Error::CorruptObject(h) => FetchFailure::Corrupt(h),
            other => FetchFailure::Failed(other.to_string()),
        }
    }

    fn into_error(self) -> Error {
        match self {
            FetchFailure::NotFound(h) => Error::ObjectNotFound(h),
            FetchFailure::CommitNotFound(h) => Error::CommitNotFound(h),
            FetchFailure::Corrupt(h) => Error::CorruptObject(h),
            FetchFailure::Failed(message) => Error::Transport { message },
        }
    }
}

impl<T> FetchSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }
}

impl ObjectStore {
    pub fn new(
        local: Arc<dyn LocalStore>,
        backing: Arc<dyn BackingStore>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        Self::with_metadata_cache_size(local, backing, stats, METADATA_CACHE_SIZE)
    }

    pub(crate) fn with_metadata_cache_size(
        local: Arc<dyn LocalStore>,
        backing: Arc<dyn BackingStore>,
        stats: Arc<Stats>,
        cache_size: usize,
    ) -> Arc<Self> {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            local,
            backing,
            metadata_cache: Mutex::new(LruCache::new(capacity)),
            inflight_trees: DashMap::new(),
            inflight_blobs: DashMap::new(),
            stats,
        })
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    pub fn backing(&self) -> &Arc<dyn BackingStore> {
        &self.backing
    }

    /// get a tree by hash, fetching and caching on local miss
    pub fn get_tree(&self, hash: &Hash) -> Result<Arc<Tree>> {
        if let Some(bytes) = self.local.get(KeySpace::Tree, hash.as_bytes())? {
            bump(&self.stats.object_store.local_hits);
            return Ok(Arc::new(Tree::deserialize(*hash, &bytes)?));
        }
        self.coalesced_fetch(&self.inflight_trees, hash, || {
            self.fetch_tree_from_backing(hash)
        })
    }

    /// get a blob by hash, fetching and caching on local miss
    pub fn get_blob(&self, hash: &Hash) -> Result<Arc<Blob>> {
        if let Some(bytes) = self.local.get(KeySpace::Blob, hash.as_bytes())? {
            bump(&self.stats.object_store.local_hits);
            return Ok(Arc::new(Blob::new(*hash, bytes)));
        }
        self.coalesced_fetch(&self.inflight_blobs, hash, || {
            self.fetch_blob_from_backing(hash)
        })
    }

    /// get blob metadata: in-memory lru, then local store, then computed
    /// from the blob body and written back to both
    pub fn get_blob_metadata(&self, hash: &Hash) -> Result<BlobMetadata> {
        if let Some(meta) = self.metadata_cache.lock().get(hash) {
            bump(&self.stats.object_store.metadata_memory_hits);
            return Ok(*meta);
        }

        if let Some(bytes) = self.local.get(KeySpace::BlobMetadata, hash.as_bytes())? {
            bump(&self.stats.object_store.local_hits);
            let meta = BlobMetadata::from_bytes(&bytes)?;
            self.metadata_cache.lock().put(*hash, meta);
            return Ok(meta);
        }

        // the blob fetch path stores metadata in both caches on a backing
        // fetch; recompute here to also cover a blob-only local hit
        let blob = self.get_blob(hash)?;
        let meta = BlobMetadata::from_blob(&blob);
        self.local
            .put(KeySpace::BlobMetadata, hash.as_bytes(), &meta.to_bytes())?;
        self.metadata_cache.lock().put(*hash, meta);
        Ok(meta)
    }

    pub fn get_blob_size(&self, hash: &Hash) -> Result<u64> {
        Ok(self.get_blob_metadata(hash)?.size)
    }

    pub fn get_blob_sha1(&self, hash: &Hash) -> Result<Hash> {
        Ok(self.get_blob_metadata(hash)?.content_sha1)
    }

    /// resolve a commit to its root tree via the commit_to_tree space
    pub fn get_tree_for_commit(&self, commit: &Hash) -> Result<Arc<Tree>> {
        if let Some(bytes) = self.local.get(KeySpace::CommitToTree, commit.as_bytes())? {
            bump(&self.stats.object_store.local_hits);
            let root = Hash::from_slice(&bytes)?;
            return self.get_tree(&root);
        }

        bump(&self.stats.object_store.backing_fetches);
        let tree = self
            .backing
            .get_tree_for_commit(commit)?
            .ok_or(Error::CommitNotFound(*commit))?;

        let mut batch = self.local.begin_write(0)?;
        batch.put(
            KeySpace::CommitToTree,
            commit.as_bytes(),
            tree.hash().as_bytes(),
        )?;
        batch.put(KeySpace::Tree, tree.hash().as_bytes(), &tree.serialize())?;
        batch.flush()?;

        Ok(Arc::new(tree))
    }

    /// hint the backing store about blobs that will be wanted soon;
    /// already-cached blobs are filtered out
    pub fn prefetch_blobs(&self, hashes: &[Hash]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let mut wanted = Vec::new();
        for hash in hashes {
            if !self.local.has_key(KeySpace::Blob, hash.as_bytes())? {
                wanted.push(*hash);
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }
        self.backing.prefetch_blobs(&wanted)
    }

    fn fetch_tree_from_backing(&self, hash: &Hash) -> Result<Arc<Tree>> {
        // an earlier leader may have written the tree back between our
        // miss and winning the in-flight slot
        if let Some(bytes) = self.local.get(KeySpace::Tree, hash.as_bytes())? {
            bump(&self.stats.object_store.local_hits);
            return Ok(Arc::new(Tree::deserialize(*hash, &bytes)?));
        }

        bump(&self.stats.object_store.backing_fetches);
        let tree = self
            .backing
            .get_tree(hash)?
            .ok_or(Error::ObjectNotFound(*hash))?;
        self.local
            .put(KeySpace::Tree, hash.as_bytes(), &tree.serialize())?;
        Ok(Arc::new(tree))
    }

    fn fetch_blob_from_backing(&self, hash: &Hash) -> Result<Arc<Blob>> {
        if let Some(bytes) = self.local.get(KeySpace::Blob, hash.as_bytes())? {
            bump(&self.stats.object_store.local_hits);
            return Ok(Arc::new(Blob::new(*hash, bytes)));
        }

        bump(&self.stats.object_store.backing_fetches);
        let blob = self
            .backing
            .get_blob(hash)?
            .ok_or(Error::ObjectNotFound(*hash))?;
        if &sha1_of(blob.contents()) != hash {
            return Err(Error::CorruptObject(*hash));
        }

        let meta = BlobMetadata::from_blob(&blob);
        let mut batch = self.local.begin_write(0)?;
        batch.put(KeySpace::Blob, hash.as_bytes(), blob.contents())?;
        batch.put(KeySpace::BlobMetadata, hash.as_bytes(), &meta.to_bytes())?;
        batch.flush()?;
        self.metadata_cache.lock().put(*hash, meta);

        Ok(Arc::new(blob))
    }

    /// at most one backing fetch is in flight per hash; later callers
    /// share the leader's outcome
    fn coalesced_fetch<T, F>(
        &self,
        inflight: &DashMap<Hash, Arc<FetchSlot<T>>>,
        hash: &Hash,
        fetch: F,
    ) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<Arc<T>>,
    {
        use dashmap::mapref::entry::Entry;

        let (slot, leader) = match inflight.entry(*hash) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(FetchSlot::new());
                vacant.insert(slot.clone());
                (slot, true)
            }
        };

        if leader {
            let outcome = fetch().map_err(FetchFailure::from_error);
            {
                let mut state = slot.state.lock();
                *state = Some(outcome.clone());
            }
            slot.cond.notify_all();
            inflight.remove(hash);
            outcome.map_err(FetchFailure::into_error)
        } else {
            bump(&self.stats.object_store.coalesced_fetches);
            let mut state = slot.state.lock();
            while state.is_none() {
                slot.cond.wait(&mut state);
            }
            state
                .clone()
                .expect("fetch slot signalled without an outcome")
                .map_err(FetchFailure::into_error)
        }
    }
}
