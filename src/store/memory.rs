use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::error;

use crate::error::Result;
use crate::store::{KeySpace, LocalStore, WriteBatch};

/// in-memory LocalStore, used by tests and cache-less mounts
#[derive(Default)]
pub struct MemoryLocalStore {
    spaces: [RwLock<BTreeMap<Vec<u8>, Vec<u8>>>; KeySpace::ALL.len()],
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.spaces[space.index()].read().get(key).cloned())
    }

    fn get_batch(&self, space: KeySpace, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let map = self.spaces[space.index()].read();
        Ok(keys.iter().map(|k| map.get(k.as_slice()).cloned()).collect())
    }

    fn has_key(&self, space: KeySpace, key: &[u8]) -> Result<bool> {
        Ok(self.spaces[space.index()].read().contains_key(key))
    }

    fn put(&self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()> {
        self.spaces[space.index()]
            .write()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn begin_write(&self, buffer_bytes: usize) -> Result<Box<dyn WriteBatch + '_>> {
        Ok(Box::new(MemoryWriteBatch {
            store: self,
            pending: Vec::new(),
            buffered: 0,
            buffer_bytes,
        }))
    }

    fn clear_space(&self, space: KeySpace) -> Result<()> {
        self.spaces[space.index()].write().clear();
        Ok(())
    }

    fn compact_space(&self, _space: KeySpace) -> Result<()> {
        Ok(())
    }

    fn approximate_size(&self, space: KeySpace) -> Result<u64> {
        let map = self.spaces[space.index()].read();
        Ok(map
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum())
    }
}

struct MemoryWriteBatch<'a> {
    store: &'a MemoryLocalStore,
    pending: Vec<(KeySpace, Vec<u8>, Vec<u8>)>,
    buffered: usize,
    buffer_bytes: usize,
}

impl WriteBatch for MemoryWriteBatch<'_> {
    fn put(&mut self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()> {
        self.buffered += key.len() + value.len();
        self.pending.push((space, key.to_vec(), value.to_vec()));
        if self.buffer_bytes > 0 && self.buffered >= self.buffer_bytes {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for (space, key, value) in self.pending.drain(..) {
            self.store.spaces[space.index()].write().insert(key, value);
        }
        self.buffered = 0;
        Ok(())
    }
}

impl Drop for MemoryWriteBatch<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            error!(
                pending = self.pending.len(),
                "write batch dropped with writes pending flush"
            );
        }
    }
}
