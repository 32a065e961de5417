use std::io;

use dist_lock::LockError;

/// Failure kinds surfaced by the file operations. The dispatcher translates
/// these into protocol errors; the `kind` string travels in `error.data` so
/// clients can discriminate without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("path escapes the root directory: {0:?}")]
    PathEscape(String),
    #[error("no such entry: {0:?}")]
    NotFound(String),
    #[error("entry already exists: {0:?}")]
    AlreadyExists(String),
    #[error("not a directory: {0:?}")]
    NotADirectory(String),
    #[error("is a directory: {0:?}")]
    IsADirectory(String),
    #[error("not a regular file: {0:?}")]
    NotAFile(String),
    #[error("directory not empty: {0:?}")]
    DirectoryNotEmpty(String),
    #[error("access denied: {0:?}")]
    AccessDenied(String),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Wire name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            FsError::InvalidArgument(_) => "InvalidArgument",
            FsError::PathEscape(_) => "PathEscape",
            FsError::NotFound(_) => "NotFound",
            FsError::AlreadyExists(_) => "AlreadyExists",
            FsError::NotADirectory(_) => "NotADirectory",
            FsError::IsADirectory(_) => "IsADirectory",
            FsError::NotAFile(_) => "NotAFile",
            FsError::DirectoryNotEmpty(_) => "DirectoryNotEmpty",
            FsError::AccessDenied(_) => "AccessDenied",
            FsError::Lock(_) => "LockUnavailable",
            FsError::Io(_) => "IOError",
        }
    }

    /// True for errors caused by the caller's arguments rather than the
    /// state of the tree or the host.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, FsError::InvalidArgument(_) | FsError::PathEscape(_))
    }
}

/// Maps a host I/O error to the taxonomy, attributing it to `path`.
pub(crate) fn io_error(e: io::Error, path: &str) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_owned()),
        io::ErrorKind::PermissionDenied => FsError::AccessDenied(path.to_owned()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_owned()),
        _ => match e.raw_os_error() {
            Some(libc::ENOTDIR) => FsError::NotADirectory(path.to_owned()),
            Some(libc::EISDIR) => FsError::IsADirectory(path.to_owned()),
            Some(libc::ENOTEMPTY) => FsError::DirectoryNotEmpty(path.to_owned()),
            _ => FsError::Io(e),
        },
    }
}
