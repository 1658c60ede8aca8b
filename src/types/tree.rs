use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{Hash, HASH_LEN};

/// kind of a tree entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Regular,
    Executable,
    Symlink,
    Tree,
}

impl EntryKind {
    /// get the type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            EntryKind::Regular => "regular",
            EntryKind::Executable => "executable",
            EntryKind::Symlink => "symlink",
            EntryKind::Tree => "tree",
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, EntryKind::Tree)
    }

    pub(crate) fn as_byte(&self) -> u8 {
        match self {
            EntryKind::Regular => 0,
            EntryKind::Executable => 1,
            EntryKind::Symlink => 2,
            EntryKind::Tree => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(EntryKind::Regular),
            1 => Ok(EntryKind::Executable),
            2 => Ok(EntryKind::Symlink),
            3 => Ok(EntryKind::Tree),
            other => Err(Error::CorruptObjectMessage(format!(
                "unknown tree entry kind byte {other}"
            ))),
        }
    }
}

/// a single entry in a tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub hash: Hash,
    pub kind: EntryKind,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, hash: Hash, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            hash,
            kind,
        }
    }
}

/// an immutable directory tree - entries sorted by name, identified by its own hash
///
/// the hash is assigned by the importer that produced the tree; it is never
/// re-derived from the serialized form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    hash: Hash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// create a new tree, validating and sorting entries
    pub fn new(hash: Hash, mut entries: Vec<TreeEntry>) -> Result<Self> {
        for entry in &entries {
            validate_entry_name(&entry.name)?;
        }

        // sort by name (byte-wise)
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

        for window in entries.windows(2) {
            if window[0].name == window[1].name {
                return Err(Error::DuplicateEntryName(window[0].name.clone()));
            }
        }

        Ok(Self { hash, entries })
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// look up entry by name
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// serialize for caching in the local store
    ///
    /// layout: u32 LE entry count, then per entry u16 LE name length,
    /// name bytes, one kind byte, 20 hash bytes. entries are already sorted.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            out.extend_from_slice(entry.name.as_bytes());
            out.push(entry.kind.as_byte());
            out.extend_from_slice(entry.hash.as_bytes());
        }
        out
    }

    /// parse a serialized tree cached under the given hash
    pub fn deserialize(hash: Hash, bytes: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| Error::CorruptObjectMessage(format!("tree {hash}: {msg}"));

        if bytes.len() < 4 {
            return Err(corrupt("truncated entry count"));
        }
        let mut count_bytes = [0u8; 4];
        count_bytes.copy_from_slice(&bytes[..4]);
        let count = u32::from_le_bytes(count_bytes) as usize;

        let mut pos = 4;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if bytes.len() < pos + 2 {
                return Err(corrupt("truncated name length"));
            }
            let name_len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
            pos += 2;

            if bytes.len() < pos + name_len + 1 + HASH_LEN {
                return Err(corrupt("truncated entry"));
            }
            let name = std::str::from_utf8(&bytes[pos..pos + name_len])
                .map_err(|_| corrupt("entry name is not utf-8"))?
                .to_string();
            pos += name_len;

            let kind = EntryKind::from_byte(bytes[pos])?;
            pos += 1;

            let entry_hash = Hash::from_slice(&bytes[pos..pos + HASH_LEN])?;
            pos += HASH_LEN;

            entries.push(TreeEntry::new(name, entry_hash, kind));
        }
        if pos != bytes.len() {
            return Err(corrupt("trailing bytes after last entry"));
        }

        Tree::new(hash, entries)
    }
}

/// validate an entry name
pub(crate) fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEntryName("empty name".to_string()));
    }
    if name.contains('/') {
        return Err(Error::InvalidEntryName(format!(
            "name contains '/': {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidEntryName(format!(
            "name contains null byte: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidEntryName(format!("reserved name: {}", name)));
    }
    Ok(())
}
