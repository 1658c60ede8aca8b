use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::types::EntryKind;

/// inode number of the mount root
pub const ROOT_INO: u64 = 1;

const INFO_MAGIC: &[u8] = b"scmfs-overlay\x00\x01";

/// one entry of a materialized directory listing
///
/// `hash` present means the child still equals that source object;
/// absent marks the child as itself materialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEntry {
    pub name: String,
    pub ino: u64,
    pub kind: EntryKind,
    pub hash: Option<Hash>,
}

/// per-mount persistent store of materialized inode state, keyed by
/// inode number
///
/// directory listings are CBOR records, file bodies are raw bytes.
/// record creation is atomic (tmp + rename) so a listing referencing a
/// child record never becomes visible before that record exists.
pub struct Overlay {
    dir: PathBuf,
    next_ino: Mutex<u64>,
    _lock: Flock<File>,
}

impl Overlay {
    /// open (creating if needed) the overlay at `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join("dirs")).with_path(dir)?;
        fs::create_dir_all(dir.join("files")).with_path(dir)?;
        fs::create_dir_all(dir.join("tmp")).with_path(dir)?;

        let info_path = dir.join("info");
        let fresh = !info_path.exists();
        if fresh {
            let mut file = File::create(&info_path).with_path(&info_path)?;
            file.write_all(INFO_MAGIC).with_path(&info_path)?;
            file.sync_all().with_path(&info_path)?;
        }

        let info = OpenOptions::new()
            .read(true)
            .open(&info_path)
            .with_path(&info_path)?;
        let lock =
            Flock::lock(info, FlockArg::LockExclusiveNonblock).map_err(|_| Error::LockContention)?;

        let contents = fs::read(&info_path).with_path(&info_path)?;
        if contents != INFO_MAGIC {
            return Err(Error::CorruptOverlay {
                ino: ROOT_INO,
                message: "overlay info file has wrong magic".to_string(),
            });
        }

        let next_path = dir.join("next-inode");
        let next_ino = if next_path.exists() {
            let bytes = fs::read(&next_path).with_path(&next_path)?;
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| Error::CorruptOverlay {
                ino: ROOT_INO,
                message: format!("next-inode record has {} bytes, expected 8", bytes.len()),
            })?;
            u64::from_le_bytes(arr)
        } else {
            ROOT_INO + 1
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            next_ino: Mutex::new(next_ino),
            _lock: lock,
        })
    }

    /// hand out the next inode number; strictly monotone and persisted
    /// before the caller observes it
    pub fn allocate_inode_number(&self) -> Result<u64> {
        let mut next = self.next_ino.lock();
        let ino = *next;
        let following = ino + 1;
        self.write_atomic(&self.dir.join("next-inode"), &following.to_le_bytes())?;
        *next = following;
        Ok(ino)
    }

    /// materialized listing for an inode, if one exists
    pub fn load_directory(&self, ino: u64) -> Result<Option<Vec<OverlayEntry>>> {
        let path = self.dir_record_path(ino);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io { path, source: e }),
        };
        let entries: Vec<OverlayEntry> =
            ciborium::from_reader(bytes.as_slice()).map_err(|e| Error::CorruptOverlay {
                ino,
                message: format!("undecodable directory record: {e}"),
            })?;
        Ok(Some(entries))
    }

    /// atomically replace the listing for an inode
    pub fn save_directory(&self, ino: u64, entries: &[OverlayEntry]) -> Result<()> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&entries, &mut bytes)?;
        self.write_atomic(&self.dir_record_path(ino), &bytes)
    }

    /// create the backing body for a materialized file or symlink
    pub fn create_file(&self, ino: u64, contents: &[u8]) -> Result<()> {
        self.write_atomic(&self.file_record_path(ino), contents)
    }

    /// open the backing body of a materialized file for read/write
    pub fn open_file(&self, ino: u64) -> Result<File> {
        let path = self.file_record_path(ino);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::CorruptOverlay {
                        ino,
                        message: "missing file body for materialized inode".to_string(),
                    }
                } else {
                    Error::Io { path, source: e }
                }
            })
    }

    /// read an entire materialized file body
    pub fn read_file(&self, ino: u64) -> Result<Vec<u8>> {
        let path = self.file_record_path(ino);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CorruptOverlay {
                    ino,
                    message: "missing file body for materialized inode".to_string(),
                }
            } else {
                Error::Io { path, source: e }
            }
        })
    }

    pub fn file_size(&self, ino: u64) -> Result<u64> {
        let path = self.file_record_path(ino);
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CorruptOverlay {
                    ino,
                    message: "missing file body for materialized inode".to_string(),
                }
            } else {
                Error::Io { path, source: e }
            }
        })?;
        Ok(meta.len())
    }

    /// write into a materialized file body at an offset, extending it
    /// if the write runs past the current end
    pub fn write_at(&self, ino: u64, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        let path = self.file_record_path(ino);
        let mut file = self.open_file(ino)?;
        file.seek(SeekFrom::Start(offset)).with_path(&path)?;
        file.write_all(data).with_path(&path)?;
        Ok(())
    }

    /// read up to `len` bytes from a materialized file body at an offset
    pub fn read_at(&self, ino: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let path = self.file_record_path(ino);
        let mut file = self.open_file(ino)?;
        file.seek(SeekFrom::Start(offset)).with_path(&path)?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).with_path(&path)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// resize a materialized file body
    pub fn set_len(&self, ino: u64, len: u64) -> Result<()> {
        let path = self.file_record_path(ino);
        let file = self.open_file(ino)?;
        file.set_len(len).with_path(&path)?;
        Ok(())
    }

    /// drop all records for an unlinked inode
    pub fn remove(&self, ino: u64) -> Result<()> {
        for path in [self.file_record_path(ino), self.dir_record_path(ino)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io { path, source: e }),
            }
        }
        Ok(())
    }

    /// true if the overlay holds any record for this inode
    pub fn has_record(&self, ino: u64) -> bool {
        self.file_record_path(ino).exists() || self.dir_record_path(ino).exists()
    }

    fn dir_record_path(&self, ino: u64) -> PathBuf {
        self.dir.join("dirs").join(ino.to_string())
    }

    fn file_record_path(&self, ino: u64) -> PathBuf {
        self.dir.join("files").join(ino.to_string())
    }

    /// temp file + rename so readers only ever observe complete records
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp_path = self.dir.join("tmp").join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp.write_all(bytes).with_path(&tmp_path)?;
            tmp.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, path).with_path(path)?;
        Ok(())
    }
}
