use std::path::PathBuf;

use crate::hash::Hash;

/// error type for scmfs operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object not found: {0}")]
    ObjectNotFound(Hash),

    #[error("commit not found: {0}")]
    CommitNotFound(Hash),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("store is read-only")]
    ReadOnlyStore,

    #[error("operation interrupted: {0}")]
    Interrupted(String),

    #[error("corrupt object: hash mismatch for {0}")]
    CorruptObject(Hash),

    #[error("corrupt object: {0}")]
    CorruptObjectMessage(String),

    #[error("corrupt snapshot at {path}: {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("corrupt overlay record for inode {ino}: {message}")]
    CorruptOverlay { ino: u64, message: String },

    #[error("materialization invariant violated at inode {ino}: {message}")]
    InvariantViolation { ino: u64, message: String },

    #[error("subtree at inode {ino} is degraded and refuses writes")]
    Degraded { ino: u64 },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("checkout not found at {0}")]
    NoCheckout(PathBuf),

    #[error("checkout already exists at {0}")]
    CheckoutExists(PathBuf),

    #[error("lock contention on overlay")]
    LockContention,

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("invalid hash length: {0} bytes")]
    InvalidHashLength(usize),

    #[error("invalid tree entry name: {0}")]
    InvalidEntryName(String),

    #[error("duplicate tree entry name: {0}")]
    DuplicateEntryName(String),

    #[error("invalid glob pattern {pattern}: {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("invalid value for config setting {key}: {message}")]
    InvalidConfigValue { key: String, message: String },

    #[error("unknown config setting: {0}")]
    UnknownConfigKey(String),

    #[error("thread pool error: {0}")]
    ThreadPool(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("local store error: {0}")]
    LocalStore(#[from] sled::Error),

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// error codes surfaced to the filesystem bridge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    NotADirectory,
    IsADirectory,
    NotEmpty,
    Exists,
    IoError,
    ReadOnly,
    Interrupted,
}

impl Error {
    /// collapse the error into the code the kernel bridge understands
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ObjectNotFound(_)
            | Error::CommitNotFound(_)
            | Error::PathNotFound(_)
            | Error::NoCheckout(_) => ErrorCode::NotFound,
            Error::NotADirectory(_) => ErrorCode::NotADirectory,
            Error::IsADirectory(_) => ErrorCode::IsADirectory,
            Error::NotEmpty(_) => ErrorCode::NotEmpty,
            Error::AlreadyExists(_) | Error::CheckoutExists(_) => ErrorCode::Exists,
            Error::ReadOnlyStore | Error::Degraded { .. } => ErrorCode::ReadOnly,
            Error::Interrupted(_) | Error::LockContention => ErrorCode::Interrupted,
            _ => ErrorCode::IoError,
        }
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(Error::ObjectNotFound(Hash::ZERO).code(), ErrorCode::NotFound);
        assert_eq!(
            Error::PathNotFound("a/b".to_string()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            Error::NotADirectory("a".to_string()).code(),
            ErrorCode::NotADirectory
        );
        assert_eq!(
            Error::NotEmpty("dir".to_string()).code(),
            ErrorCode::NotEmpty
        );
        assert_eq!(
            Error::AlreadyExists("f".to_string()).code(),
            ErrorCode::Exists
        );
        assert_eq!(Error::ReadOnlyStore.code(), ErrorCode::ReadOnly);
        assert_eq!(Error::Degraded { ino: 7 }.code(), ErrorCode::ReadOnly);
        assert_eq!(
            Error::Transport {
                message: "gone".to_string()
            }
            .code(),
            ErrorCode::IoError
        );
    }

    #[test]
    fn test_with_path() {
        let io: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let err = io.with_path("/some/where").unwrap_err();
        match err {
            Error::Io { path, .. } => assert_eq!(path, PathBuf::from("/some/where")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
