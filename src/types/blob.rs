use crate::error::{Error, Result};
use crate::hash::{sha1_of, Hash, HASH_LEN};

/// an immutable byte sequence identified by its content hash
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    hash: Hash,
    contents: Vec<u8>,
}

impl Blob {
    pub fn new(hash: Hash, contents: Vec<u8>) -> Self {
        Self { hash, contents }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }
}

/// size and content sha1 of a blob, cacheable independently of the body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobMetadata {
    pub size: u64,
    pub content_sha1: Hash,
}

/// serialized length: 8-byte LE size followed by the 20-byte sha1
const METADATA_LEN: usize = 8 + HASH_LEN;

impl BlobMetadata {
    pub fn from_blob(blob: &Blob) -> Self {
        Self {
            size: blob.size(),
            content_sha1: sha1_of(blob.contents()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_LEN);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(self.content_sha1.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != METADATA_LEN {
            return Err(Error::CorruptObjectMessage(format!(
                "blob metadata record has {} bytes, expected {}",
                bytes.len(),
                METADATA_LEN
            )));
        }
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&bytes[..8]);
        Ok(Self {
            size: u64::from_le_bytes(size_bytes),
            content_sha1: Hash::from_slice(&bytes[8..])?,
        })
    }
}
