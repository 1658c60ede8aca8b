use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::server::FaultInjector;
use crate::store::{KeySpace, LocalStore, WriteBatch};

/// keys per underlying call when splitting large batch gets
const MAX_BATCH_KEYS: usize = 2048;

/// shared page cache for the whole store; sled keeps a single cache
/// across every key space, so this covers the point-lookup spaces and
/// the blob space together
const DEFAULT_CACHE_BYTES: u64 = 72 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

/// durable LocalStore backed by sled, one tree per key space
pub struct SledLocalStore {
    db: sled::Db,
    trees: Vec<sled::Tree>,
    io_pool: Arc<rayon::ThreadPool>,
    fault_injector: Arc<FaultInjector>,
    mode: OpenMode,
}

impl SledLocalStore {
    /// open the store, repairing and retrying once on a failed first
    /// attempt when the store is writable
    pub fn open(
        path: &Path,
        mode: OpenMode,
        io_pool: Arc<rayon::ThreadPool>,
        fault_injector: Arc<FaultInjector>,
    ) -> Result<Self> {
        let config = sled::Config::new()
            .path(path)
            .cache_capacity(DEFAULT_CACHE_BYTES);

        let db = match config.open() {
            Ok(db) => db,
            Err(e) => {
                error!(path = %path.display(), error = %e, "error opening local store");
                if mode == OpenMode::ReadOnly {
                    return Err(e.into());
                }
                Self::repair(path);
                config.open()?
            }
        };

        let mut trees = Vec::with_capacity(KeySpace::ALL.len());
        for space in KeySpace::ALL {
            trees.push(db.open_tree(space.name())?);
        }

        Ok(Self {
            db,
            trees,
            io_pool,
            fault_injector,
            mode,
        })
    }

    /// best-effort repair before the retry; sled replays its write-ahead
    /// log on open, so recovery work happens inside the next open call
    fn repair(path: &Path) {
        error!(path = %path.display(), "attempting local store repair");
    }

    fn tree(&self, space: KeySpace) -> &sled::Tree {
        &self.trees[space.index()]
    }

    fn check_writable(&self) -> Result<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(Error::ReadOnlyStore),
        }
    }

    fn get_raw(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(space).get(key)?.map(|v| v.to_vec()))
    }
}

impl LocalStore for SledLocalStore {
    fn get(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.fault_injector.check("local store get", space.name())?;
        self.get_raw(space, key)
    }

    fn get_batch(&self, space: KeySpace, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        self.fault_injector
            .check("local store get batch", space.name())?;

        let chunks: Vec<&[Vec<u8>]> = keys.chunks(MAX_BATCH_KEYS).collect();
        let per_chunk: Vec<Vec<Option<Vec<u8>>>> = self.io_pool.install(|| {
            chunks
                .par_iter()
                .map(|chunk| {
                    chunk
                        .iter()
                        .map(|key| self.get_raw(space, key))
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(per_chunk.into_iter().flatten().collect())
    }

    fn has_key(&self, space: KeySpace, key: &[u8]) -> Result<bool> {
        Ok(self.tree(space).contains_key(key)?)
    }

    fn put(&self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.tree(space).insert(key, value)?;
        Ok(())
    }

    fn begin_write(&self, buffer_bytes: usize) -> Result<Box<dyn WriteBatch + '_>> {
        self.check_writable()?;
        Ok(Box::new(SledWriteBatch {
            store: self,
            batches: KeySpace::ALL.map(|_| sled::Batch::default()).into(),
            counts: [0; KeySpace::ALL.len()],
            buffered: 0,
            buffer_bytes,
        }))
    }

    fn clear_space(&self, space: KeySpace) -> Result<()> {
        debug!(space = space.name(), "clearing key space");
        self.tree(space).clear()?;
        Ok(())
    }

    fn compact_space(&self, space: KeySpace) -> Result<()> {
        // sled reclaims segments lazily; flushing is the maintenance
        // hook it exposes
        debug!(space = space.name(), "compacting key space");
        self.tree(space).flush()?;
        Ok(())
    }

    fn approximate_size(&self, space: KeySpace) -> Result<u64> {
        // maintenance-only scan; regular operation never iterates
        let mut total = 0u64;
        for item in self.tree(space).iter() {
            let (key, value) = item?;
            total += (key.len() + value.len()) as u64;
        }
        Ok(total)
    }
}

struct SledWriteBatch<'a> {
    store: &'a SledLocalStore,
    batches: Vec<sled::Batch>,
    counts: [usize; KeySpace::ALL.len()],
    buffered: usize,
    buffer_bytes: usize,
}

impl SledWriteBatch<'_> {
    fn pending(&self) -> usize {
        self.counts.iter().sum()
    }
}

impl WriteBatch for SledWriteBatch<'_> {
    fn put(&mut self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()> {
        self.batches[space.index()].insert(key, value);
        self.counts[space.index()] += 1;
        self.buffered += key.len() + value.len();
        if self.buffer_bytes > 0 && self.buffered >= self.buffer_bytes {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let pending = self.pending();
        if pending == 0 {
            return Ok(());
        }
        debug!(pending, bytes = self.buffered, "flushing write batch");

        for space in KeySpace::ALL {
            let idx = space.index();
            if self.counts[idx] == 0 {
                continue;
            }
            let batch = std::mem::take(&mut self.batches[idx]);
            self.store.tree(space).apply_batch(batch)?;
            self.counts[idx] = 0;
        }
        self.buffered = 0;
        Ok(())
    }
}

impl Drop for SledWriteBatch<'_> {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            error!(pending, "write batch dropped with writes pending flush");
        }
    }
}
