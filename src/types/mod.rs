mod blob;
mod commit;
mod tree;

pub use blob::{Blob, BlobMetadata};
pub use commit::ParentCommits;
pub use tree::{EntryKind, Tree, TreeEntry};

pub(crate) use tree::validate_entry_name;
