//! scmfs - core of a virtual source-control-backed filesystem daemon
//!
//! end users see what looks like a full working-copy checkout; file and
//! directory contents are materialized on demand from an immutable
//! content-addressed object store, cached locally, and overlaid with the
//! user's uncommitted edits. one daemon process serves many mounts.
//!
//! # Core pieces
//!
//! - **ObjectStore**: two-tier cache (local key-value store in front of
//!   the backing store) serving trees, blobs and blob metadata by hash,
//!   with request coalescing and an in-memory metadata lru
//! - **Inodes**: a hybrid graph where every entry is either still equal
//!   to its source object or has diverged into the per-mount overlay
//! - **GlobNode**: a prefix-merged pattern tree that walks the hybrid
//!   graph doing the minimum tree loading, optionally emitting prefetch
//!   hints
//!
//! # Example usage
//!
//! ```no_run
//! use scmfs::{CheckoutConfig, DaemonConfig, Mount, ObjectStore, ServerState};
//! use scmfs::{OpenMode, SledLocalStore};
//! use std::sync::Arc;
//!
//! # fn run(backing: Arc<dyn scmfs::BackingStore>) -> scmfs::Result<()> {
//! let server = ServerState::new(DaemonConfig::default())?;
//! let config = CheckoutConfig::load_from_client_dir(
//!     "/mnt/checkout",
//!     "/var/lib/scmfs/clients/checkout",
//! )?;
//! let local = SledLocalStore::open(
//!     &config.local_store_path(),
//!     OpenMode::ReadWrite,
//!     server.io_pool().clone(),
//!     server.fault_injector().clone(),
//! )?;
//! let store = ObjectStore::new(Arc::new(local), backing, server.stats().clone());
//! let mount = Mount::open(config, store, &server)?;
//! let hello = mount.get_file_inode("README.md")?;
//! let bytes = hello.read_all(mount.core())?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod hash;
mod overlay;
mod stats;

pub mod glob;
pub mod inodes;
pub mod mount;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testharness;

pub use config::{
    BindMount, CheckoutConfig, ConfigReload, ConfigSetting, ConfigSource, DaemonConfig,
    FieldConverter, ReloadableConfig,
};
pub use error::{Error, ErrorCode, IoResultExt, Result};
pub use glob::{GlobNode, GlobResult, PrefetchList};
pub use hash::{sha1_of, Hash, HASH_LEN};
pub use inodes::{DirListEntry, FileInode, Inode, InodeMap, MountCore, ParentLink, TreeInode};
pub use mount::Mount;
pub use overlay::{Overlay, OverlayEntry, ROOT_INO};
pub use server::{FaultInjector, ServerState};
pub use stats::{Stats, StatsSnapshot};
pub use store::{
    BackingStore, KeySpace, LocalStore, MemoryLocalStore, ObjectStore, OpenMode, SledLocalStore,
    WriteBatch, METADATA_CACHE_SIZE,
};
pub use types::{Blob, BlobMetadata, EntryKind, ParentCommits, Tree, TreeEntry};
