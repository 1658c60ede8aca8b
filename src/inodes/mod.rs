//! the live inode graph of one mount: directories and files promoted on
//! demand from immutable source trees, diverging into the overlay on
//! mutation.

mod file;
mod tree;

pub use file::FileInode;
pub use tree::{DirListEntry, TreeInode};

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::overlay::Overlay;
use crate::stats::Stats;
use crate::store::ObjectStore;
use crate::types::EntryKind;

pub use crate::overlay::ROOT_INO;

/// shared per-mount context threaded through every inode operation
///
/// inodes hold no back-pointer to this; the mount passes it in
/// explicitly, which keeps the graph cycle-free.
pub struct MountCore {
    pub overlay: Overlay,
    pub store: Arc<ObjectStore>,
    pub inodes: InodeMap,
    pub stats: Arc<Stats>,
}

impl MountCore {
    pub fn new(overlay: Overlay, store: Arc<ObjectStore>, stats: Arc<Stats>) -> Self {
        Self {
            overlay,
            store,
            inodes: InodeMap::new(),
            stats,
        }
    }

    /// drop unmaterialized, unreferenced tree inodes from the map
    ///
    /// a candidate reverts to a lazy stub in its parent's listing; its
    /// identity survives because the stub keeps the allocated ino.
    pub fn evict_unreferenced(&self) -> usize {
        let mut evicted = 0;
        let candidates: Vec<Arc<TreeInode>> = self
            .inodes
            .map
            .iter()
            .filter_map(|entry| match entry.value() {
                Inode::Tree(tree) if tree.ino() != ROOT_INO => Some(tree.clone()),
                _ => None,
            })
            .collect();

        for tree in candidates {
            if tree.demote_if_unreferenced(self) {
                self.inodes.remove(tree.ino());
                evicted += 1;
            }
        }
        evicted
    }
}

/// a live inode: either a directory or a file/symlink
#[derive(Clone)]
pub enum Inode {
    Tree(Arc<TreeInode>),
    File(Arc<FileInode>),
}

impl Inode {
    pub fn ino(&self) -> u64 {
        match self {
            Inode::Tree(t) => t.ino(),
            Inode::File(f) => f.ino(),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Inode::Tree(_) => EntryKind::Tree,
            Inode::File(f) => f.kind(),
        }
    }

    pub fn is_materialized(&self) -> bool {
        match self {
            Inode::Tree(t) => t.is_materialized(),
            Inode::File(f) => f.is_materialized(),
        }
    }

    pub fn as_tree(&self) -> Option<&Arc<TreeInode>> {
        match self {
            Inode::Tree(t) => Some(t),
            Inode::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileInode>> {
        match self {
            Inode::File(f) => Some(f),
            Inode::Tree(_) => None,
        }
    }

    pub(crate) fn set_parent(&self, link: Option<ParentLink>) {
        match self {
            Inode::Tree(t) => t.set_parent(link),
            Inode::File(f) => f.set_parent(link),
        }
    }
}

/// the parent relation: never owning, resolved through the inode map
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentLink {
    pub parent: u64,
    pub name: String,
}

/// read-mostly map of all loaded inodes in a mount, keyed by ino
pub struct InodeMap {
    map: DashMap<u64, Inode>,
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeMap {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub fn insert(&self, inode: Inode) {
        self.map.insert(inode.ino(), inode);
    }

    pub fn get(&self, ino: u64) -> Option<Inode> {
        self.map.get(&ino).map(|entry| entry.value().clone())
    }

    /// resolve a parent link; a dangling link is an invariant violation
    pub fn get_tree(&self, ino: u64) -> Result<Arc<TreeInode>> {
        match self.get(ino) {
            Some(Inode::Tree(tree)) => Ok(tree),
            Some(Inode::File(_)) => Err(Error::InvariantViolation {
                ino,
                message: "parent link resolves to a file inode".to_string(),
            }),
            None => Err(Error::InvariantViolation {
                ino,
                message: "parent link resolves to no loaded inode".to_string(),
            }),
        }
    }

    pub fn remove(&self, ino: u64) -> Option<Inode> {
        self.map.remove(&ino).map(|(_, inode)| inode)
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.map.contains_key(&ino)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// one entry in a live directory listing
///
/// `kind` and `hash` are cached here so a parent can persist its
/// overlay record without touching any child lock; they are kept in
/// sync by promotion, chmod and materialization notices.
#[derive(Clone)]
pub(crate) enum DirEntry {
    /// known only as (name, hash, kind); no live inode yet
    Stub {
        kind: EntryKind,
        hash: Option<Hash>,
        ino: Option<u64>,
    },
    /// promoted to a live inode
    Loaded {
        inode: Inode,
        kind: EntryKind,
        hash: Option<Hash>,
    },
}

impl DirEntry {
    pub(crate) fn kind(&self) -> EntryKind {
        match self {
            DirEntry::Stub { kind, .. } => *kind,
            DirEntry::Loaded { kind, .. } => *kind,
        }
    }

    pub(crate) fn hash(&self) -> Option<Hash> {
        match self {
            DirEntry::Stub { hash, .. } => *hash,
            DirEntry::Loaded { hash, .. } => *hash,
        }
    }

    pub(crate) fn ino(&self) -> Option<u64> {
        match self {
            DirEntry::Stub { ino, .. } => *ino,
            DirEntry::Loaded { inode, .. } => Some(inode.ino()),
        }
    }

    pub(crate) fn loaded(&self) -> Option<&Inode> {
        match self {
            DirEntry::Loaded { inode, .. } => Some(inode),
            DirEntry::Stub { .. } => None,
        }
    }
}
