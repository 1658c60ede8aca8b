use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CheckoutConfig;
use crate::error::{Error, Result};
use crate::glob::{GlobNode, GlobResult, PrefetchList};
use crate::inodes::{FileInode, Inode, MountCore, TreeInode, ROOT_INO};
use crate::overlay::Overlay;
use crate::server::ServerState;
use crate::store::ObjectStore;
use crate::types::ParentCommits;

/// one live checkout: the composition root tying the overlay, the
/// shared object store and the inode graph together
///
/// the root tree comes from the snapshot's first parent unless the
/// overlay already holds a record for the root, in which case the
/// user's materialized view wins.
pub struct Mount {
    config: CheckoutConfig,
    core: Arc<MountCore>,
    parents: Mutex<ParentCommits>,
    root: Arc<TreeInode>,
}

impl Mount {
    pub fn open(
        config: CheckoutConfig,
        store: Arc<ObjectStore>,
        server: &ServerState,
    ) -> Result<Self> {
        let overlay = Overlay::open(&config.overlay_path())?;
        let parents = config.read_snapshot()?;

        let root_source = if overlay.has_record(ROOT_INO) {
            None
        } else {
            let tree = store.get_tree_for_commit(&parents.parent1)?;
            Some(*tree.hash())
        };

        let core = Arc::new(MountCore::new(overlay, store, server.stats().clone()));
        let root = TreeInode::new_root(root_source);
        core.inodes.insert(Inode::Tree(root.clone()));

        Ok(Self {
            config,
            core,
            parents: Mutex::new(parents),
            root,
        })
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    pub fn core(&self) -> &MountCore {
        &self.core
    }

    pub fn root(&self) -> &Arc<TreeInode> {
        &self.root
    }

    pub fn parents(&self) -> ParentCommits {
        *self.parents.lock()
    }

    /// record new working-copy parents; the snapshot file is updated
    /// before the in-memory view
    pub fn set_parents(&self, parents: ParentCommits) -> Result<()> {
        let mut guard = self.parents.lock();
        self.config.write_snapshot(&parents)?;
        *guard = parents;
        Ok(())
    }

    /// resolve a slash-separated path to an inode, promoting lazy
    /// stubs along the way; the empty path is the root
    pub fn get_inode(&self, path: &str) -> Result<Inode> {
        let mut current = Inode::Tree(self.root.clone());
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let dir = current
                .as_tree()
                .ok_or_else(|| Error::NotADirectory(path.to_string()))?
                .clone();
            current = dir.lookup(&self.core, component)?;
        }
        Ok(current)
    }

    pub fn get_tree_inode(&self, path: &str) -> Result<Arc<TreeInode>> {
        match self.get_inode(path)? {
            Inode::Tree(tree) => Ok(tree),
            Inode::File(_) => Err(Error::NotADirectory(path.to_string())),
        }
    }

    pub fn get_file_inode(&self, path: &str) -> Result<Arc<FileInode>> {
        match self.get_inode(path)? {
            Inode::File(file) => Ok(file),
            Inode::Tree(_) => Err(Error::IsADirectory(path.to_string())),
        }
    }

    /// evaluate glob patterns against the mount root
    pub fn glob(
        &self,
        patterns: &[&str],
        include_dotfiles: bool,
        prefetch: Option<&PrefetchList>,
    ) -> Result<Vec<GlobResult>> {
        let mut glob_root = GlobNode::new_root(include_dotfiles);
        for pattern in patterns {
            glob_root.parse(pattern)?;
        }
        glob_root.evaluate(&self.core, &self.root, prefetch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha1_of;
    use crate::testharness::{TestMount, TreeBuilder};
    use crate::types::EntryKind;

    fn fixture() -> TreeBuilder {
        let mut builder = TreeBuilder::new();
        builder.set_file("dir/a.txt", b"a");
        builder.set_file("dir/sub/b.txt", b"b");
        builder.set_file(".watchmanconfig", b"wat");
        builder
    }

    #[test]
    fn test_get_inode_walks_paths() {
        let mount = TestMount::new(fixture());

        let root = mount.mount.get_inode("").unwrap();
        assert_eq!(root.ino(), ROOT_INO);

        let file = mount.mount.get_file_inode("dir/a.txt").unwrap();
        assert_eq!(file.kind(), EntryKind::Regular);

        let tree = mount.mount.get_tree_inode("dir/sub").unwrap();
        assert!(!tree.is_materialized());

        assert!(matches!(
            mount.mount.get_inode("dir/missing"),
            Err(Error::PathNotFound(_))
        ));
        assert!(matches!(
            mount.mount.get_inode("dir/a.txt/nested"),
            Err(Error::NotADirectory(_))
        ));
        assert!(matches!(
            mount.mount.get_file_inode("dir"),
            Err(Error::IsADirectory(_))
        ));
    }

    #[test]
    fn test_parents_roundtrip() {
        let mount = TestMount::new(fixture());
        let initial = mount.mount.parents();
        assert_eq!(initial.parent2, None);

        let merged = ParentCommits::new(initial.parent1, Some(sha1_of(b"other-commit")));
        mount.mount.set_parents(merged).unwrap();
        assert_eq!(mount.mount.parents(), merged);

        // the snapshot file reflects the merge
        let read = mount.mount.config().read_snapshot().unwrap();
        assert_eq!(read, merged);
    }

    #[test]
    fn test_root_survives_remount_materialized() {
        let mount = TestMount::new(fixture());
        mount.add_file("new.txt", b"fresh");
        assert!(mount.root_is_materialized());

        let mount = mount.reopen();
        assert!(mount.root_is_materialized());
        assert_eq!(mount.read("new.txt"), b"fresh");
        // source-backed entries still resolve after the remount
        assert_eq!(mount.read("dir/a.txt"), b"a");
    }

    #[test]
    fn test_glob_through_mount() {
        let mount = TestMount::new(fixture());
        let results = mount.mount.glob(&["**/*.txt"], true, None).unwrap();
        let paths: Vec<_> = results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["dir/a.txt", "dir/sub/b.txt"]);
    }
}
