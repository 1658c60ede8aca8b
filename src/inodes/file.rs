use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hash::{sha1_of, Hash};
use crate::inodes::{MountCore, ParentLink};
use crate::stats::bump;
use crate::types::EntryKind;

/// a live regular file, executable or symlink
///
/// unmaterialized content is the backing blob named by `source`;
/// materialized content lives in the overlay under this inode number.
pub struct FileInode {
    ino: u64,
    parent: Mutex<Option<ParentLink>>,
    state: Mutex<FileState>,
}

struct FileState {
    kind: EntryKind,
    /// present while content still equals the backing blob
    source: Option<Hash>,
    /// content sha1 of the current materialized version; dropped on
    /// every write or truncate
    sha1: Option<Hash>,
}

impl FileInode {
    pub(crate) fn new(ino: u64, kind: EntryKind, source: Option<Hash>) -> Self {
        Self {
            ino,
            parent: Mutex::new(None),
            state: Mutex::new(FileState {
                kind,
                source,
                sha1: None,
            }),
        }
    }

    pub(crate) fn new_materialized(ino: u64, kind: EntryKind) -> Self {
        Self::new(ino, kind, None)
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn kind(&self) -> EntryKind {
        self.state.lock().kind
    }

    pub fn is_materialized(&self) -> bool {
        self.state.lock().source.is_none()
    }

    pub fn source_hash(&self) -> Option<Hash> {
        self.state.lock().source
    }

    pub fn parent_link(&self) -> Option<ParentLink> {
        self.parent.lock().clone()
    }

    pub(crate) fn set_parent(&self, link: Option<ParentLink>) {
        *self.parent.lock() = link;
    }

    pub(crate) fn set_kind(&self, kind: EntryKind) {
        self.state.lock().kind = kind;
    }

    /// read a window of the file
    pub fn read(&self, core: &MountCore, offset: u64, len: usize) -> Result<Vec<u8>> {
        let source = self.state.lock().source;
        match source {
            Some(hash) => {
                // fetch without holding the inode lock
                let blob = core.store.get_blob(&hash)?;
                let bytes = blob.contents();
                let start = offset.min(bytes.len() as u64) as usize;
                let end = start.saturating_add(len).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            None => {
                let _st = self.state.lock();
                core.overlay.read_at(self.ino, offset, len)
            }
        }
    }

    /// read the whole file
    pub fn read_all(&self, core: &MountCore) -> Result<Vec<u8>> {
        let source = self.state.lock().source;
        match source {
            Some(hash) => Ok(core.store.get_blob(&hash)?.contents().to_vec()),
            None => {
                let _st = self.state.lock();
                core.overlay.read_file(self.ino)
            }
        }
    }

    /// resolve a symlink's target
    pub fn readlink(&self, core: &MountCore) -> Result<String> {
        if self.kind() != EntryKind::Symlink {
            return Err(Error::NotADirectory(format!(
                "inode {} is not a symlink",
                self.ino
            )));
        }
        let bytes = self.read_all(core)?;
        String::from_utf8(bytes).map_err(|_| Error::CorruptOverlay {
            ino: self.ino,
            message: "symlink target is not utf-8".to_string(),
        })
    }

    /// write at an offset; forces materialization first
    pub fn write(&self, core: &MountCore, offset: u64, data: &[u8]) -> Result<()> {
        self.materialize(core)?;
        let mut st = self.state.lock();
        core.overlay.write_at(self.ino, offset, data)?;
        st.sha1 = None;
        Ok(())
    }

    /// resize the file; forces materialization first
    pub fn truncate(&self, core: &MountCore, len: u64) -> Result<()> {
        self.materialize(core)?;
        let mut st = self.state.lock();
        core.overlay.set_len(self.ino, len)?;
        st.sha1 = None;
        Ok(())
    }

    pub fn get_size(&self, core: &MountCore) -> Result<u64> {
        let source = self.state.lock().source;
        match source {
            Some(hash) => core.store.get_blob_size(&hash),
            None => {
                let _st = self.state.lock();
                core.overlay.file_size(self.ino)
            }
        }
    }

    pub fn get_sha1(&self, core: &MountCore) -> Result<Hash> {
        let source = self.state.lock().source;
        match source {
            Some(hash) => core.store.get_blob_sha1(&hash),
            None => {
                let mut st = self.state.lock();
                if let Some(sha1) = st.sha1 {
                    return Ok(sha1);
                }
                let sha1 = sha1_of(&core.overlay.read_file(self.ino)?);
                st.sha1 = Some(sha1);
                Ok(sha1)
            }
        }
    }

    /// copy the backing blob into the overlay and clear the source hash
    ///
    /// ancestors materialize first so the parent invariant holds at
    /// every observable step; the blob fetch happens with the inode lock
    /// released, and the state is re-validated afterwards.
    pub fn materialize(&self, core: &MountCore) -> Result<()> {
        {
            let st = self.state.lock();
            if st.source.is_none() {
                return Ok(());
            }
        }

        let link = self.parent.lock().clone();
        if let Some(l) = &link {
            core.inodes.get_tree(l.parent)?.materialize(core)?;
        }

        loop {
            let source = {
                let st = self.state.lock();
                match st.source {
                    None => return Ok(()),
                    Some(hash) => hash,
                }
            };

            let blob = core.store.get_blob(&source)?;

            let mut st = self.state.lock();
            match st.source {
                None => return Ok(()), // lost the race, someone else copied
                Some(current) if current != source => continue,
                Some(_) => {}
            }
            // overlay record first, then the in-memory flip
            core.overlay.create_file(self.ino, blob.contents())?;
            st.source = None;
            st.sha1 = None;
            drop(st);
            bump(&core.stats.inodes.materializations);

            if let Some(l) = link {
                core.inodes.get_tree(l.parent)?.note_child_materialized(core, &l.name)?;
            }
            return Ok(());
        }
    }
}

impl std::fmt::Debug for FileInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("FileInode")
            .field("ino", &self.ino)
            .field("kind", &st.kind)
            .field("source", &st.source)
            .finish()
    }
}
