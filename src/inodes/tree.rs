use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::error;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::inodes::{DirEntry, FileInode, Inode, MountCore, ParentLink, ROOT_INO};
use crate::overlay::OverlayEntry;
use crate::stats::bump;
use crate::types::{validate_entry_name, EntryKind};

/// a live directory
///
/// unmaterialized, the listing mirrors the source tree named by
/// `source_hash`; materialized, it is the overlay record under this
/// inode number. children start as lazy stubs and are promoted to
/// inodes on lookup, never on readdir.
pub struct TreeInode {
    ino: u64,
    parent: Mutex<Option<ParentLink>>,
    state: Mutex<TreeState>,
}

struct TreeState {
    /// present while the listing still equals this source tree
    source_hash: Option<Hash>,
    /// whether `entries` has been populated from the source or overlay
    loaded: bool,
    /// set when the overlay record for a materialized directory is
    /// missing or undecodable; the subtree then refuses writes
    degraded: bool,
    entries: BTreeMap<String, DirEntry>,
}

/// one row of a readdir listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub ino: u64,
}

/// listing row handed to the glob evaluator; never allocates inos and
/// never promotes stubs
#[derive(Clone)]
pub(crate) struct ChildView {
    pub name: String,
    pub kind: EntryKind,
    pub hash: Option<Hash>,
    pub inode: Option<Inode>,
}

impl TreeInode {
    /// `source_hash` present: unmaterialized, listing loads from that
    /// tree. absent: materialized, listing loads from the overlay.
    pub(crate) fn new(ino: u64, source_hash: Option<Hash>) -> Self {
        Self {
            ino,
            parent: Mutex::new(None),
            state: Mutex::new(TreeState {
                source_hash,
                loaded: false,
                degraded: false,
                entries: BTreeMap::new(),
            }),
        }
    }

    /// a freshly created, empty, materialized directory
    pub(crate) fn new_materialized_empty(ino: u64) -> Self {
        Self {
            ino,
            parent: Mutex::new(None),
            state: Mutex::new(TreeState {
                source_hash: None,
                loaded: true,
                degraded: false,
                entries: BTreeMap::new(),
            }),
        }
    }

    pub fn new_root(source_hash: Option<Hash>) -> Arc<Self> {
        Arc::new(Self::new(ROOT_INO, source_hash))
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn is_materialized(&self) -> bool {
        self.state.lock().source_hash.is_none()
    }

    pub fn source_hash(&self) -> Option<Hash> {
        self.state.lock().source_hash
    }

    pub fn parent_link(&self) -> Option<ParentLink> {
        self.parent.lock().clone()
    }

    pub(crate) fn set_parent(&self, link: Option<ParentLink>) {
        *self.parent.lock() = link;
    }

    /// listing with entries populated; the load suspends on the object
    /// store or overlay, so the lock is dropped for the fetch and the
    /// state re-validated afterwards
    fn loaded_state(&self, core: &MountCore) -> Result<MutexGuard<'_, TreeState>> {
        let source = {
            let st = self.state.lock();
            if st.loaded {
                return Ok(st);
            }
            if st.degraded {
                return Err(Error::Degraded { ino: self.ino });
            }
            st.source_hash
        };

        let entries: BTreeMap<String, DirEntry> = match source {
            Some(hash) => {
                let tree = core.store.get_tree(&hash)?;
                tree.entries()
                    .iter()
                    .map(|e| {
                        (
                            e.name.clone(),
                            DirEntry::Stub {
                                kind: e.kind,
                                hash: Some(e.hash),
                                ino: None,
                            },
                        )
                    })
                    .collect()
            }
            None => match core.overlay.load_directory(self.ino)? {
                Some(listing) => listing
                    .into_iter()
                    .map(|e| {
                        let OverlayEntry {
                            name,
                            ino,
                            kind,
                            hash,
                        } = e;
                        (
                            name,
                            DirEntry::Stub {
                                kind,
                                hash,
                                ino: Some(ino),
                            },
                        )
                    })
                    .collect(),
                None => {
                    let mut st = self.state.lock();
                    st.degraded = true;
                    error!(
                        ino = self.ino,
                        "materialized directory has no overlay record; marking subtree degraded"
                    );
                    return Err(Error::InvariantViolation {
                        ino: self.ino,
                        message: "materialized directory has no overlay record".to_string(),
                    });
                }
            },
        };

        let mut st = self.state.lock();
        if !st.loaded {
            st.entries = entries;
            st.loaded = true;
        }
        Ok(st)
    }

    /// look up one child, promoting a lazy stub to a live inode
    pub fn lookup(&self, core: &MountCore, name: &str) -> Result<Inode> {
        bump(&core.stats.inodes.lookups);
        let mut st = self.loaded_state(core)?;

        let (kind, hash, existing_ino) = match st.entries.get(name) {
            None => return Err(Error::PathNotFound(name.to_string())),
            Some(DirEntry::Loaded { inode, .. }) => return Ok(inode.clone()),
            Some(DirEntry::Stub { kind, hash, ino }) => (*kind, *hash, *ino),
        };

        let ino = match existing_ino {
            Some(ino) => ino,
            None => core.overlay.allocate_inode_number()?,
        };
        let inode = if kind.is_tree() {
            Inode::Tree(Arc::new(TreeInode::new(ino, hash)))
        } else {
            Inode::File(Arc::new(FileInode::new(ino, kind, hash)))
        };
        inode.set_parent(Some(ParentLink {
            parent: self.ino,
            name: name.to_string(),
        }));
        core.inodes.insert(inode.clone());
        bump(&core.stats.inodes.inodes_created);

        st.entries.insert(
            name.to_string(),
            DirEntry::Loaded {
                inode: inode.clone(),
                kind,
                hash,
            },
        );
        Ok(inode)
    }

    /// enumerate the listing without promoting any stub; inode numbers
    /// are allocated here on first observation
    pub fn readdir(&self, core: &MountCore) -> Result<Vec<DirListEntry>> {
        let mut st = self.loaded_state(core)?;
        let mut out = Vec::with_capacity(st.entries.len());
        for (name, entry) in st.entries.iter_mut() {
            let ino = match entry {
                DirEntry::Stub { ino: slot, .. } => match *slot {
                    Some(ino) => ino,
                    None => {
                        let ino = core.overlay.allocate_inode_number()?;
                        *slot = Some(ino);
                        ino
                    }
                },
                DirEntry::Loaded { inode, .. } => inode.ino(),
            };
            out.push(DirListEntry {
                name: name.clone(),
                kind: entry.kind(),
                ino,
            });
        }
        Ok(out)
    }

    /// snapshot for the glob evaluator: no promotion, no allocation
    pub(crate) fn children_for_glob(&self, core: &MountCore) -> Result<Vec<ChildView>> {
        let st = self.loaded_state(core)?;
        Ok(st
            .entries
            .iter()
            .map(|(name, entry)| ChildView {
                name: name.clone(),
                kind: entry.kind(),
                hash: entry.hash(),
                inode: entry.loaded().cloned(),
            })
            .collect())
    }

    pub fn is_empty(&self, core: &MountCore) -> Result<bool> {
        Ok(self.loaded_state(core)?.entries.is_empty())
    }

    /// write this directory's listing into the overlay and clear the
    /// source hash; ancestors first so the parent invariant holds at
    /// every observable step
    pub fn materialize(&self, core: &MountCore) -> Result<()> {
        {
            let st = self.state.lock();
            if st.degraded {
                return Err(Error::Degraded { ino: self.ino });
            }
            if st.source_hash.is_none() {
                return Ok(());
            }
        }

        let link = self.parent.lock().clone();
        if let Some(l) = &link {
            core.inodes.get_tree(l.parent)?.materialize(core)?;
        }

        let mut st = self.loaded_state(core)?;
        if st.source_hash.is_none() {
            return Ok(()); // another mutation materialized us meanwhile
        }

        let record = Self::record_entries(core, &mut st)?;
        core.overlay.save_directory(self.ino, &record)?; // overlay before the flip
        st.source_hash = None;
        drop(st);
        bump(&core.stats.inodes.materializations);

        if let Some(l) = link {
            core.inodes
                .get_tree(l.parent)?
                .note_child_materialized(core, &l.name)?;
        }
        Ok(())
    }

    /// a child diverged: persist its entry without a source hash
    pub(crate) fn note_child_materialized(&self, core: &MountCore, name: &str) -> Result<()> {
        let mut st = self.loaded_state(core)?;
        if st.source_hash.is_some() {
            return Err(Error::InvariantViolation {
                ino: self.ino,
                message: format!("child {name} materialized under an unmaterialized directory"),
            });
        }
        match st.entries.get(name) {
            None => return Ok(()),
            Some(entry) if entry.hash().is_none() => return Ok(()),
            Some(_) => {}
        }

        let mut record = Self::record_entries(core, &mut st)?;
        for e in &mut record {
            if e.name == name {
                e.hash = None;
            }
        }
        core.overlay.save_directory(self.ino, &record)?;

        if let Some(entry) = st.entries.get_mut(name) {
            match entry {
                DirEntry::Stub { hash, .. } => *hash = None,
                DirEntry::Loaded { hash, .. } => *hash = None,
            }
        }
        Ok(())
    }

    /// create an empty subdirectory
    pub fn mkdir(&self, core: &MountCore, name: &str) -> Result<Arc<TreeInode>> {
        validate_entry_name(name)?;
        self.materialize(core)?;

        let mut st = self.loaded_state(core)?;
        if st.entries.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let ino = core.overlay.allocate_inode_number()?;
        // the child record must exist before any listing references it
        core.overlay.save_directory(ino, &[])?;

        let mut record = Self::record_entries(core, &mut st)?;
        record.push(OverlayEntry {
            name: name.to_string(),
            ino,
            kind: EntryKind::Tree,
            hash: None,
        });
        record.sort_by(|a, b| a.name.cmp(&b.name));
        core.overlay.save_directory(self.ino, &record)?;

        let child = Arc::new(TreeInode::new_materialized_empty(ino));
        child.set_parent(Some(ParentLink {
            parent: self.ino,
            name: name.to_string(),
        }));
        core.inodes.insert(Inode::Tree(child.clone()));
        bump(&core.stats.inodes.inodes_created);
        st.entries.insert(
            name.to_string(),
            DirEntry::Loaded {
                inode: Inode::Tree(child.clone()),
                kind: EntryKind::Tree,
                hash: None,
            },
        );
        Ok(child)
    }

    /// create a regular file with the given contents
    pub fn create(&self, core: &MountCore, name: &str, contents: &[u8]) -> Result<Arc<FileInode>> {
        self.create_file_entry(core, name, contents, EntryKind::Regular)
    }

    /// create a symlink pointing at `target`
    pub fn symlink(&self, core: &MountCore, name: &str, target: &str) -> Result<Arc<FileInode>> {
        self.create_file_entry(core, name, target.as_bytes(), EntryKind::Symlink)
    }

    fn create_file_entry(
        &self,
        core: &MountCore,
        name: &str,
        contents: &[u8],
        kind: EntryKind,
    ) -> Result<Arc<FileInode>> {
        validate_entry_name(name)?;
        self.materialize(core)?;

        let mut st = self.loaded_state(core)?;
        if st.entries.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let ino = core.overlay.allocate_inode_number()?;
        core.overlay.create_file(ino, contents)?;

        let mut record = Self::record_entries(core, &mut st)?;
        record.push(OverlayEntry {
            name: name.to_string(),
            ino,
            kind,
            hash: None,
        });
        record.sort_by(|a, b| a.name.cmp(&b.name));
        core.overlay.save_directory(self.ino, &record)?;

        let child = Arc::new(FileInode::new_materialized(ino, kind));
        child.set_parent(Some(ParentLink {
            parent: self.ino,
            name: name.to_string(),
        }));
        core.inodes.insert(Inode::File(child.clone()));
        bump(&core.stats.inodes.inodes_created);
        st.entries.insert(
            name.to_string(),
            DirEntry::Loaded {
                inode: Inode::File(child.clone()),
                kind,
                hash: None,
            },
        );
        Ok(child)
    }

    /// remove a non-directory child
    pub fn unlink(&self, core: &MountCore, name: &str) -> Result<()> {
        {
            let st = self.loaded_state(core)?;
            let entry = st
                .entries
                .get(name)
                .ok_or_else(|| Error::PathNotFound(name.to_string()))?;
            if entry.kind().is_tree() {
                return Err(Error::IsADirectory(name.to_string()));
            }
        }
        self.materialize(core)?;

        let mut st = self.loaded_state(core)?;
        let entry = st
            .entries
            .get(name)
            .ok_or_else(|| Error::PathNotFound(name.to_string()))?;
        if entry.kind().is_tree() {
            return Err(Error::IsADirectory(name.to_string()));
        }
        let child_ino = entry.ino();

        let mut record = Self::record_entries(core, &mut st)?;
        record.retain(|e| e.name != name);
        core.overlay.save_directory(self.ino, &record)?;
        st.entries.remove(name);
        drop(st);

        if let Some(ino) = child_ino {
            core.inodes.remove(ino);
            core.overlay.remove(ino)?;
        }
        Ok(())
    }

    /// remove an empty subdirectory
    pub fn rmdir(&self, core: &MountCore, name: &str) -> Result<()> {
        loop {
            let probe = {
                let st = self.loaded_state(core)?;
                let entry = st
                    .entries
                    .get(name)
                    .ok_or_else(|| Error::PathNotFound(name.to_string()))?;
                if !entry.kind().is_tree() {
                    return Err(Error::NotADirectory(name.to_string()));
                }
                (entry.hash(), entry.ino())
            };
            // emptiness may need a tree fetch, so probe while unlocked
            if !self.probe_dir_empty(core, name, probe.0, probe.1)? {
                return Err(Error::NotEmpty(name.to_string()));
            }

            self.materialize(core)?;
            let mut st = self.loaded_state(core)?;
            let entry = st
                .entries
                .get(name)
                .ok_or_else(|| Error::PathNotFound(name.to_string()))?;
            if !entry.kind().is_tree() {
                return Err(Error::NotADirectory(name.to_string()));
            }
            if (entry.hash(), entry.ino()) != probe {
                continue; // the entry changed while we probed
            }
            let child_ino = entry.ino();

            let mut record = Self::record_entries(core, &mut st)?;
            record.retain(|e| e.name != name);
            core.overlay.save_directory(self.ino, &record)?;
            st.entries.remove(name);
            drop(st);

            if let Some(ino) = child_ino {
                core.inodes.remove(ino);
                core.overlay.remove(ino)?;
            }
            return Ok(());
        }
    }

    /// change a child's mode; the observable effect on this layer is
    /// materialization plus the regular/executable flip
    pub fn chmod(&self, core: &MountCore, name: &str, mode: u32) -> Result<()> {
        let child = self.lookup(core, name)?;
        match child {
            Inode::File(file) => {
                file.materialize(core)?;
                let new_kind = match file.kind() {
                    EntryKind::Symlink => EntryKind::Symlink,
                    _ => {
                        if mode & 0o111 != 0 {
                            EntryKind::Executable
                        } else {
                            EntryKind::Regular
                        }
                    }
                };

                let mut st = self.loaded_state(core)?;
                let mut record = Self::record_entries(core, &mut st)?;
                for e in &mut record {
                    if e.name == name {
                        e.kind = new_kind;
                    }
                }
                core.overlay.save_directory(self.ino, &record)?;
                if let Some(DirEntry::Loaded { kind, .. }) = st.entries.get_mut(name) {
                    *kind = new_kind;
                }
                drop(st);
                file.set_kind(new_kind);
            }
            Inode::Tree(tree) => tree.materialize(core)?,
        }
        Ok(())
    }

    /// change a child's ownership; only the forced materialization is
    /// visible at this layer
    pub fn chown(&self, core: &MountCore, name: &str) -> Result<()> {
        match self.lookup(core, name)? {
            Inode::File(file) => file.materialize(core),
            Inode::Tree(tree) => tree.materialize(core),
        }
    }

    /// move an entry, possibly across directories
    ///
    /// both directories are locked in ino order; parents are always
    /// allocated before their children, so ino order is ancestor-first
    /// and cannot oppose the materialization lock order.
    pub fn rename(
        core: &MountCore,
        src_dir: &Arc<TreeInode>,
        src_name: &str,
        dst_dir: &Arc<TreeInode>,
        dst_name: &str,
    ) -> Result<()> {
        validate_entry_name(dst_name)?;
        src_dir.materialize(core)?;
        dst_dir.materialize(core)?;

        if src_dir.ino == dst_dir.ino {
            return src_dir.rename_within(core, src_name, dst_name);
        }

        loop {
            let dst_probe = {
                let st = dst_dir.loaded_state(core)?;
                st.entries
                    .get(dst_name)
                    .map(|e| (e.kind(), e.hash(), e.ino()))
            };
            let dst_empty = match dst_probe {
                Some((EntryKind::Tree, hash, ino)) => {
                    Some(dst_dir.probe_dir_empty(core, dst_name, hash, ino)?)
                }
                _ => None,
            };

            // listings must be resident before the lock pair is taken
            drop(src_dir.loaded_state(core)?);
            drop(dst_dir.loaded_state(core)?);
            let (mut src_st, mut dst_st) = if src_dir.ino < dst_dir.ino {
                let a = src_dir.state.lock();
                let b = dst_dir.state.lock();
                (a, b)
            } else {
                let b = dst_dir.state.lock();
                let a = src_dir.state.lock();
                (a, b)
            };
            if !src_st.loaded || !dst_st.loaded {
                continue;
            }

            let (moving_kind, moving_hash, moving_ino, moving_inode) =
                match src_st.entries.get(src_name) {
                    Some(e) => (e.kind(), e.hash(), e.ino(), e.loaded().cloned()),
                    None => return Err(Error::PathNotFound(src_name.to_string())),
                };
            let moving_ino = moving_ino.ok_or_else(|| Error::InvariantViolation {
                ino: src_dir.ino,
                message: format!("entry {src_name} in a materialized directory has no ino"),
            })?;

            let mut replaced: Option<Option<u64>> = None;
            if let Some(existing) = dst_st.entries.get(dst_name) {
                let now = (existing.kind(), existing.hash(), existing.ino());
                if Some(now) != dst_probe {
                    continue; // destination changed while we probed
                }
                if existing.kind().is_tree() {
                    if !moving_kind.is_tree() {
                        return Err(Error::IsADirectory(dst_name.to_string()));
                    }
                    if dst_empty == Some(false) {
                        return Err(Error::NotEmpty(dst_name.to_string()));
                    }
                } else if moving_kind.is_tree() {
                    return Err(Error::NotADirectory(dst_name.to_string()));
                }
                replaced = Some(existing.ino());
            }

            // destination record first so the entry is never absent
            // from both listings
            let mut dst_record = Self::record_entries(core, &mut dst_st)?;
            dst_record.retain(|e| e.name != dst_name);
            dst_record.push(OverlayEntry {
                name: dst_name.to_string(),
                ino: moving_ino,
                kind: moving_kind,
                hash: moving_hash,
            });
            dst_record.sort_by(|a, b| a.name.cmp(&b.name));
            core.overlay.save_directory(dst_dir.ino, &dst_record)?;

            let mut src_record = Self::record_entries(core, &mut src_st)?;
            src_record.retain(|e| e.name != src_name);
            core.overlay.save_directory(src_dir.ino, &src_record)?;

            let entry = src_st
                .entries
                .remove(src_name)
                .expect("validated while locked");
            dst_st.entries.insert(dst_name.to_string(), entry);
            if let Some(inode) = &moving_inode {
                inode.set_parent(Some(ParentLink {
                    parent: dst_dir.ino,
                    name: dst_name.to_string(),
                }));
            }
            drop(src_st);
            drop(dst_st);

            if let Some(Some(ino)) = replaced {
                core.inodes.remove(ino);
                core.overlay.remove(ino)?;
            }
            return Ok(());
        }
    }

    fn rename_within(&self, core: &MountCore, src_name: &str, dst_name: &str) -> Result<()> {
        if src_name == dst_name {
            let st = self.loaded_state(core)?;
            return if st.entries.contains_key(src_name) {
                Ok(())
            } else {
                Err(Error::PathNotFound(src_name.to_string()))
            };
        }

        loop {
            let dst_probe = {
                let st = self.loaded_state(core)?;
                st.entries
                    .get(dst_name)
                    .map(|e| (e.kind(), e.hash(), e.ino()))
            };
            let dst_empty = match dst_probe {
                Some((EntryKind::Tree, hash, ino)) => {
                    Some(self.probe_dir_empty(core, dst_name, hash, ino)?)
                }
                _ => None,
            };

            let mut st = self.loaded_state(core)?;
            let (moving_kind, moving_hash, moving_ino, moving_inode) =
                match st.entries.get(src_name) {
                    Some(e) => (e.kind(), e.hash(), e.ino(), e.loaded().cloned()),
                    None => return Err(Error::PathNotFound(src_name.to_string())),
                };
            let moving_ino = moving_ino.ok_or_else(|| Error::InvariantViolation {
                ino: self.ino,
                message: format!("entry {src_name} in a materialized directory has no ino"),
            })?;

            let mut replaced: Option<Option<u64>> = None;
            if let Some(existing) = st.entries.get(dst_name) {
                let now = (existing.kind(), existing.hash(), existing.ino());
                if Some(now) != dst_probe {
                    continue;
                }
                if existing.kind().is_tree() {
                    if !moving_kind.is_tree() {
                        return Err(Error::IsADirectory(dst_name.to_string()));
                    }
                    if dst_empty == Some(false) {
                        return Err(Error::NotEmpty(dst_name.to_string()));
                    }
                } else if moving_kind.is_tree() {
                    return Err(Error::NotADirectory(dst_name.to_string()));
                }
                replaced = Some(existing.ino());
            }

            let mut record = Self::record_entries(core, &mut st)?;
            record.retain(|e| e.name != src_name && e.name != dst_name);
            record.push(OverlayEntry {
                name: dst_name.to_string(),
                ino: moving_ino,
                kind: moving_kind,
                hash: moving_hash,
            });
            record.sort_by(|a, b| a.name.cmp(&b.name));
            core.overlay.save_directory(self.ino, &record)?;

            let entry = st
                .entries
                .remove(src_name)
                .expect("validated while locked");
            st.entries.insert(dst_name.to_string(), entry);
            if let Some(inode) = &moving_inode {
                inode.set_parent(Some(ParentLink {
                    parent: self.ino,
                    name: dst_name.to_string(),
                }));
            }
            drop(st);

            if let Some(Some(ino)) = replaced {
                core.inodes.remove(ino);
                core.overlay.remove(ino)?;
            }
            return Ok(());
        }
    }

    /// emptiness of a directory-kind child without holding our lock
    /// across a fetch; a stub's answer stays valid while its hash does
    fn probe_dir_empty(
        &self,
        core: &MountCore,
        name: &str,
        hash: Option<Hash>,
        ino: Option<u64>,
    ) -> Result<bool> {
        let loaded = {
            let st = self.loaded_state(core)?;
            st.entries.get(name).and_then(|e| e.loaded().cloned())
        };
        if let Some(Inode::Tree(tree)) = loaded {
            return tree.is_empty(core);
        }
        if let Some(hash) = hash {
            return Ok(core.store.get_tree(&hash)?.is_empty());
        }
        let ino = ino.ok_or_else(|| Error::InvariantViolation {
            ino: self.ino,
            message: format!("materialized child {name} has no inode number"),
        })?;
        match core.overlay.load_directory(ino)? {
            Some(listing) => Ok(listing.is_empty()),
            None => Err(Error::InvariantViolation {
                ino,
                message: "materialized directory has no overlay record".to_string(),
            }),
        }
    }

    /// overlay record for the current listing, assigning inode numbers
    /// to any entry that does not have one yet
    fn record_entries(core: &MountCore, st: &mut TreeState) -> Result<Vec<OverlayEntry>> {
        let mut record = Vec::with_capacity(st.entries.len());
        for (name, entry) in st.entries.iter_mut() {
            let ino = match entry {
                DirEntry::Stub { ino: slot, .. } => match *slot {
                    Some(ino) => ino,
                    None => {
                        let ino = core.overlay.allocate_inode_number()?;
                        *slot = Some(ino);
                        ino
                    }
                },
                DirEntry::Loaded { inode, .. } => inode.ino(),
            };
            record.push(OverlayEntry {
                name: name.clone(),
                ino,
                kind: entry.kind(),
                hash: entry.hash(),
            });
        }
        Ok(record)
    }

    /// revert this inode to a lazy stub in its parent if nothing refers
    /// to it; used by the eviction pass
    pub(crate) fn demote_if_unreferenced(&self, core: &MountCore) -> bool {
        {
            let st = self.state.lock();
            if st.source_hash.is_none() {
                return false; // materialized inodes stay resident
            }
            if st.entries.values().any(|e| e.loaded().is_some()) {
                return false;
            }
        }
        let link = match self.parent.lock().clone() {
            Some(link) => link,
            None => return false,
        };
        let parent = match core.inodes.get(link.parent) {
            Some(Inode::Tree(parent)) => parent,
            _ => return false,
        };

        let mut pst = parent.state.lock();
        let entry = match pst.entries.get_mut(&link.name) {
            Some(entry) => entry,
            None => return false,
        };
        let arc = match entry.loaded() {
            Some(Inode::Tree(t)) if t.ino() == self.ino => t.clone(),
            _ => return false,
        };
        // expected holders while unreferenced: the parent entry, the
        // inode map, the eviction pass's candidate list, and `arc`
        if Arc::strong_count(&arc) > 4 {
            return false;
        }
        let (kind, hash) = (entry.kind(), entry.hash());
        *entry = DirEntry::Stub {
            kind,
            hash,
            ino: Some(self.ino),
        };
        true
    }
}

impl std::fmt::Debug for TreeInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("TreeInode")
            .field("ino", &self.ino)
            .field("source_hash", &st.source_hash)
            .field("loaded", &st.loaded)
            .field("entries", &st.entries.len())
            .finish()
    }
}
