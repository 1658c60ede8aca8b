//! in-crate test fixtures: a declarative tree builder, a fake backing
//! store with per-object readiness, and a fully wired test mount.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::{CheckoutConfig, DaemonConfig};
use crate::error::{Error, Result};
use crate::hash::{sha1_of, Hash};
use crate::inodes::{Inode, MountCore, TreeInode};
use crate::mount::Mount;
use crate::server::ServerState;
use crate::store::{BackingStore, LocalStore, MemoryLocalStore, ObjectStore};
use crate::types::{Blob, EntryKind, ParentCommits, Tree, TreeEntry};

/// declare a `{path -> contents}` mapping and turn it into trees and
/// blobs in a fake backing store
pub(crate) struct TreeBuilder {
    files: BTreeMap<String, Vec<u8>>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    pub fn set_file(&mut self, path: &str, contents: &[u8]) {
        self.files.insert(path.to_string(), contents.to_vec());
    }

    /// record every blob and tree into the backing store; returns the
    /// root tree hash
    pub fn build(&self, backing: &FakeBackingStore) -> Hash {
        self.build_trees(backing).0
    }

    /// like `build`, also returning the tree hash of every directory
    /// keyed by its path ("" is the root)
    pub fn build_trees(&self, backing: &FakeBackingStore) -> (Hash, BTreeMap<String, Hash>) {
        let mut index = BTreeMap::new();
        let root = self.build_dir("", backing, &mut index);
        (root, index)
    }

    fn build_dir(
        &self,
        prefix: &str,
        backing: &FakeBackingStore,
        index: &mut BTreeMap<String, Hash>,
    ) -> Hash {
        let mut entries: Vec<TreeEntry> = Vec::new();
        let mut subdirs: Vec<String> = Vec::new();
        let prefix_slash = format!("{prefix}/");

        for (path, contents) in &self.files {
            let relative = if prefix.is_empty() {
                path.as_str()
            } else {
                match path.strip_prefix(prefix_slash.as_str()) {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            match relative.split_once('/') {
                None => {
                    let hash = backing.put_blob(contents);
                    entries.push(TreeEntry::new(relative, hash, EntryKind::Regular));
                }
                Some((dir, _)) => {
                    if !subdirs.iter().any(|d| d == dir) {
                        subdirs.push(dir.to_string());
                    }
                }
            }
        }

        for dir in subdirs {
            let child_prefix = if prefix.is_empty() {
                dir.clone()
            } else {
                format!("{prefix}/{dir}")
            };
            let hash = self.build_dir(&child_prefix, backing, index);
            entries.push(TreeEntry::new(dir, hash, EntryKind::Tree));
        }

        // the importer assigns tree hashes; the fake uses the sha1 of
        // the serialized form
        let unkeyed = Tree::new(Hash::ZERO, entries.clone()).expect("valid test entries");
        let hash = sha1_of(&unkeyed.serialize());
        let tree = Tree::new(hash, entries).expect("valid test entries");
        backing.insert_tree(tree);
        index.insert(prefix.to_string(), hash);
        hash
    }
}

enum ReadyState {
    All,
    Some(HashSet<Hash>),
}

struct Gate {
    blocked: Mutex<bool>,
    cond: Condvar,
}

/// fake authoritative store: objects can be individually deferred to
/// observe lazy loading, fetches are counted per hash, and a gate can
/// hold every fetch open to pile callers onto one in-flight slot
pub(crate) struct FakeBackingStore {
    trees: Mutex<HashMap<Hash, Tree>>,
    blobs: Mutex<HashMap<Hash, Vec<u8>>>,
    commits: Mutex<HashMap<Hash, Hash>>,
    ready: Mutex<ReadyState>,
    tree_fetches: Mutex<HashMap<Hash, u64>>,
    blob_fetches: Mutex<HashMap<Hash, u64>>,
    commit_fetches: Mutex<HashMap<Hash, u64>>,
    prefetched: Mutex<Vec<Hash>>,
    gate: Gate,
}

impl FakeBackingStore {
    pub fn new() -> Self {
        Self {
            trees: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            commits: Mutex::new(HashMap::new()),
            ready: Mutex::new(ReadyState::All),
            tree_fetches: Mutex::new(HashMap::new()),
            blob_fetches: Mutex::new(HashMap::new()),
            commit_fetches: Mutex::new(HashMap::new()),
            prefetched: Mutex::new(Vec::new()),
            gate: Gate {
                blocked: Mutex::new(false),
                cond: Condvar::new(),
            },
        }
    }

    pub fn insert_tree(&self, tree: Tree) {
        self.trees.lock().insert(*tree.hash(), tree);
    }

    /// store a blob under the sha1 of its contents
    pub fn put_blob(&self, contents: &[u8]) -> Hash {
        let hash = sha1_of(contents);
        self.blobs.lock().insert(hash, contents.to_vec());
        hash
    }

    /// store a blob under an arbitrary hash, for corruption tests
    pub fn put_blob_raw(&self, hash: Hash, contents: Vec<u8>) {
        self.blobs.lock().insert(hash, contents);
    }

    pub fn put_commit(&self, commit: Hash, root_tree: Hash) {
        self.commits.lock().insert(commit, root_tree);
    }

    pub fn set_all_ready(&self) {
        *self.ready.lock() = ReadyState::All;
    }

    /// every object becomes unready until marked ready individually
    pub fn defer_all(&self) {
        *self.ready.lock() = ReadyState::Some(HashSet::new());
    }

    pub fn make_ready(&self, hash: Hash) {
        if let ReadyState::Some(set) = &mut *self.ready.lock() {
            set.insert(hash);
        }
    }

    /// hold every fetch until `unblock_fetches`
    pub fn block_fetches(&self) {
        *self.gate.blocked.lock() = true;
    }

    pub fn unblock_fetches(&self) {
        *self.gate.blocked.lock() = false;
        self.gate.cond.notify_all();
    }

    pub fn tree_fetch_count(&self, hash: &Hash) -> u64 {
        self.tree_fetches.lock().get(hash).copied().unwrap_or(0)
    }

    pub fn blob_fetch_count(&self, hash: &Hash) -> u64 {
        self.blob_fetches.lock().get(hash).copied().unwrap_or(0)
    }

    pub fn commit_fetch_count(&self, hash: &Hash) -> u64 {
        self.commit_fetches.lock().get(hash).copied().unwrap_or(0)
    }

    pub fn prefetched(&self) -> Vec<Hash> {
        self.prefetched.lock().clone()
    }

    fn wait_gate(&self) {
        let mut blocked = self.gate.blocked.lock();
        while *blocked {
            self.gate.cond.wait(&mut blocked);
        }
    }

    fn is_ready(&self, hash: &Hash) -> bool {
        match &*self.ready.lock() {
            ReadyState::All => true,
            ReadyState::Some(set) => set.contains(hash),
        }
    }

    fn check_ready(&self, hash: &Hash) -> Result<()> {
        if self.is_ready(hash) {
            Ok(())
        } else {
            Err(Error::Transport {
                message: format!("object {hash} is not ready"),
            })
        }
    }
}

impl BackingStore for FakeBackingStore {
    fn get_tree(&self, hash: &Hash) -> Result<Option<Tree>> {
        self.wait_gate();
        *self.tree_fetches.lock().entry(*hash).or_insert(0) += 1;
        self.check_ready(hash)?;
        Ok(self.trees.lock().get(hash).cloned())
    }

    fn get_blob(&self, hash: &Hash) -> Result<Option<Blob>> {
        self.wait_gate();
        *self.blob_fetches.lock().entry(*hash).or_insert(0) += 1;
        self.check_ready(hash)?;
        Ok(self
            .blobs
            .lock()
            .get(hash)
            .map(|bytes| Blob::new(*hash, bytes.clone())))
    }

    fn get_tree_for_commit(&self, commit: &Hash) -> Result<Option<Tree>> {
        self.wait_gate();
        *self.commit_fetches.lock().entry(*commit).or_insert(0) += 1;
        self.check_ready(commit)?;
        let root = match self.commits.lock().get(commit).copied() {
            Some(root) => root,
            None => return Ok(None),
        };
        Ok(self.trees.lock().get(&root).cloned())
    }

    fn prefetch_blobs(&self, hashes: &[Hash]) -> Result<()> {
        self.prefetched.lock().extend_from_slice(hashes);
        Ok(())
    }
}

/// a fully wired mount over a fake backing store and an in-memory
/// local store, on a temp directory
pub(crate) struct TestMount {
    _tmp: tempfile::TempDir,
    pub server: ServerState,
    pub backing: Arc<FakeBackingStore>,
    local: Arc<MemoryLocalStore>,
    pub mount: Mount,
    pub commit: Hash,
    tree_hashes: BTreeMap<String, Hash>,
}

impl TestMount {
    /// all objects immediately fetchable
    pub fn new(builder: TreeBuilder) -> Self {
        Self::build(builder, true)
    }

    /// objects deferred except the commit and root tree, which the
    /// mount open itself needs
    pub fn with_deferred(builder: TreeBuilder) -> Self {
        Self::build(builder, false)
    }

    fn build(builder: TreeBuilder, all_ready: bool) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let backing = Arc::new(FakeBackingStore::new());
        let (root_hash, tree_hashes) = builder.build_trees(&backing);
        let commit = sha1_of(b"test-commit-1");
        backing.put_commit(commit, root_hash);
        if !all_ready {
            backing.defer_all();
            backing.make_ready(commit);
            backing.make_ready(root_hash);
        }

        let server = ServerState::new(DaemonConfig::default()).unwrap();
        let local = Arc::new(MemoryLocalStore::new());
        let local_dyn: Arc<dyn LocalStore> = local.clone();
        let store = ObjectStore::new(local_dyn, backing.clone(), server.stats().clone());

        let client_dir = tmp.path().join("client");
        fs::create_dir_all(&client_dir).unwrap();
        let config = CheckoutConfig::new(
            tmp.path().join("mnt"),
            &client_dir,
            "hg",
            "ssh://test/repo",
        );
        config.save().unwrap();
        config
            .write_snapshot(&ParentCommits::single(commit))
            .unwrap();

        let mount = Mount::open(config, store, &server).unwrap();
        Self {
            _tmp: tmp,
            server,
            backing,
            local,
            mount,
            commit,
            tree_hashes,
        }
    }

    /// drop the mount and open it again over the same client directory
    /// and local store, as a daemon restart would
    pub fn reopen(self) -> Self {
        let TestMount {
            _tmp,
            server,
            backing,
            local,
            mount,
            commit,
            tree_hashes,
        } = self;
        let config = mount.config().clone();
        drop(mount); // releases the overlay lock

        let local_dyn: Arc<dyn LocalStore> = local.clone();
        let store = ObjectStore::new(local_dyn, backing.clone(), server.stats().clone());
        let mount = Mount::open(config, store, &server).unwrap();
        Self {
            _tmp,
            server,
            backing,
            local,
            mount,
            commit,
            tree_hashes,
        }
    }

    pub fn core(&self) -> &MountCore {
        self.mount.core()
    }

    pub fn root(&self) -> &Arc<TreeInode> {
        self.mount.root()
    }

    pub fn root_is_materialized(&self) -> bool {
        self.mount.root().is_materialized()
    }

    pub fn tree_hash(&self, path: &str) -> Hash {
        *self
            .tree_hashes
            .get(path)
            .unwrap_or_else(|| panic!("no source tree at {path:?}"))
    }

    pub fn make_tree_ready(&self, path: &str) {
        self.backing.make_ready(self.tree_hash(path));
    }

    pub fn make_blob_ready(&self, contents: &[u8]) {
        self.backing.make_ready(sha1_of(contents));
    }

    fn split_parent<'a>(path: &'a str) -> (&'a str, &'a str) {
        match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        }
    }

    /// resolve a directory, creating missing components
    pub fn ensure_dir(&self, path: &str) -> Arc<TreeInode> {
        let mut current = self.mount.root().clone();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = match current.lookup(self.core(), component) {
                Ok(Inode::Tree(tree)) => tree,
                Ok(Inode::File(_)) => panic!("{component} is a file"),
                Err(Error::PathNotFound(_)) => current.mkdir(self.core(), component).unwrap(),
                Err(e) => panic!("lookup failed: {e}"),
            };
        }
        current
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        let (dir, name) = Self::split_parent(path);
        self.ensure_dir(dir)
            .create(self.core(), name, contents)
            .unwrap();
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        let (dir, name) = Self::split_parent(path);
        self.ensure_dir(dir)
            .symlink(self.core(), name, target)
            .unwrap();
    }

    pub fn chmod(&self, path: &str, mode: u32) {
        let (dir, name) = Self::split_parent(path);
        self.mount
            .get_tree_inode(dir)
            .unwrap()
            .chmod(self.core(), name, mode)
            .unwrap();
    }

    pub fn read(&self, path: &str) -> Vec<u8> {
        self.mount
            .get_file_inode(path)
            .unwrap()
            .read_all(self.core())
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_builder_shapes_nested_trees() {
        let backing = FakeBackingStore::new();
        let mut builder = TreeBuilder::new();
        builder.set_file("a.txt", b"top");
        builder.set_file("dir/b.txt", b"nested");
        builder.set_file("dir/deep/c.txt", b"deeper");

        let (root, index) = builder.build_trees(&backing);
        assert_eq!(index[""], root);
        assert!(index.contains_key("dir"));
        assert!(index.contains_key("dir/deep"));

        let root_tree = backing.trees.lock().get(&root).cloned().unwrap();
        assert_eq!(root_tree.get("a.txt").unwrap().kind, EntryKind::Regular);
        assert_eq!(root_tree.get("dir").unwrap().kind, EntryKind::Tree);
        assert_eq!(root_tree.get("dir").unwrap().hash, index["dir"]);

        // blobs are stored under the sha1 of their contents
        assert!(backing.blobs.lock().contains_key(&sha1_of(b"nested")));
    }

    #[test]
    fn test_readiness_gates_fetches() {
        let backing = FakeBackingStore::new();
        let hash = backing.put_blob(b"payload");

        assert!(backing.get_blob(&hash).unwrap().is_some());

        backing.defer_all();
        assert!(backing.get_blob(&hash).is_err());

        backing.make_ready(hash);
        assert!(backing.get_blob(&hash).unwrap().is_some());
        assert_eq!(backing.blob_fetch_count(&hash), 3);
    }

    #[test]
    fn test_test_mount_reads_source_files() {
        let mut builder = TreeBuilder::new();
        builder.set_file("dir/hello.txt", b"hello");
        let mount = TestMount::new(builder);
        assert_eq!(mount.read("dir/hello.txt"), b"hello");
        assert!(!mount.root_is_materialized());
    }
}
