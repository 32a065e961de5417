//! Typed file-operation primitives rooted at a single directory.
//!
//! [`FileOps`] exposes the operations the RPC layer dispatches to: stat,
//! list, create, delete, move, copy, ranged read, and coordinated append.
//! Every caller path goes through [`RootDir::resolve`] first, so nothing
//! here ever touches the host filesystem outside the configured root.
//! Appends additionally serialize through the distributed lock client, which
//! is the only cross-instance coordination in the system.

mod error;
mod path;

use std::io::SeekFrom;

use camino::Utf8Path;
use dist_lock::LockClient;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use crate::error::FsError;
pub use crate::path::RootDir;
use crate::error::io_error;

/// Per-call cap on ranged reads, in bytes.
pub const MAX_READ: u64 = 1024 * 1024;

/// The record returned for stat and list operations. `path` is always
/// root-relative; absolute host paths never cross the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub name: String,
    pub path: String,
    pub size: u64,
}

/// File operations bound to a root directory and a lock client. Cheap to
/// clone; handlers share one instance per process.
#[derive(Clone)]
pub struct FileOps {
    root: RootDir,
    locks: LockClient,
}

impl FileOps {
    pub fn new(root: RootDir, locks: LockClient) -> Self {
        Self { root, locks }
    }

    pub fn root(&self) -> &RootDir {
        &self.root
    }

    /// Describes a single entry. Follows symlinks, like `stat(2)`.
    pub async fn stat(&self, path: &str) -> Result<EntryDescriptor, FsError> {
        let abs = self.root.resolve(path)?;
        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| io_error(e, path))?;
        Ok(self.describe(&abs, meta.len()))
    }

    /// Lists the children of a directory in the filesystem's natural order.
    /// Children that vanish between enumeration and stat are skipped; the
    /// aggregate never fails on a single entry.
    pub async fn list(&self, path: &str) -> Result<Vec<EntryDescriptor>, FsError> {
        let abs = self.root.resolve(path)?;
        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| io_error(e, path))?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(path.to_owned()));
        }

        let mut dir = tokio::fs::read_dir(&abs)
            .await
            .map_err(|e| io_error(e, path))?;
        let rel_parent = self.root.relativize(&abs);
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(e, path))? {
            let Ok(name) = entry.file_name().into_string() else {
                // Paths are UTF-8 strings on the wire; skip anything else.
                continue;
            };
            match entry.metadata().await {
                Ok(meta) => entries.push(EntryDescriptor {
                    path: join_relative(&rel_parent, &name),
                    name,
                    size: meta.len(),
                }),
                Err(e) => {
                    debug!(parent = %path, entry = %name, error = %e, "skipping unreadable entry");
                }
            }
        }
        Ok(entries)
    }

    /// Creates an empty regular file. The parent must already exist.
    pub async fn create_file(&self, path: &str) -> Result<(), FsError> {
        let abs = self.root.resolve(path)?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&abs)
            .await
            .map_err(|e| io_error(e, path))?;
        Ok(())
    }

    /// Creates a single directory (not the chain up to it).
    pub async fn create_dir(&self, path: &str) -> Result<(), FsError> {
        let abs = self.root.resolve(path)?;
        tokio::fs::create_dir(&abs)
            .await
            .map_err(|e| io_error(e, path))?;
        Ok(())
    }

    /// Removes an entry. Returns `Ok(false)` when there is nothing at `path`.
    /// Symlinks are removed themselves, never their targets. A non-recursive
    /// delete of a populated directory fails with [`FsError::DirectoryNotEmpty`].
    pub async fn delete(&self, path: &str, recursive: bool) -> Result<bool, FsError> {
        let abs = self.root.resolve(path)?;
        let meta = match tokio::fs::symlink_metadata(&abs).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error(e, path)),
        };

        if meta.is_dir() {
            if recursive {
                // Depth-first; the first failing node aborts the walk.
                tokio::fs::remove_dir_all(&abs)
                    .await
                    .map_err(|e| io_error(e, path))?;
            } else {
                let mut dir = tokio::fs::read_dir(&abs)
                    .await
                    .map_err(|e| io_error(e, path))?;
                if dir
                    .next_entry()
                    .await
                    .map_err(|e| io_error(e, path))?
                    .is_some()
                {
                    return Err(FsError::DirectoryNotEmpty(path.to_owned()));
                }
                tokio::fs::remove_dir(&abs)
                    .await
                    .map_err(|e| io_error(e, path))?;
            }
        } else {
            tokio::fs::remove_file(&abs)
                .await
                .map_err(|e| io_error(e, path))?;
        }
        Ok(true)
    }

    /// Moves `source` to `target`. Prefers an atomic rename; a rename
    /// rejected with `EXDEV` falls back to copy-then-delete for regular
    /// files, which is not atomic and is logged as such.
    pub async fn move_entry(&self, source: &str, target: &str) -> Result<(), FsError> {
        let src = self.root.resolve(source)?;
        let dst = self.root.resolve(target)?;
        if src == dst {
            return Err(FsError::InvalidArgument(
                "source and target are the same path".to_owned(),
            ));
        }
        if dst.starts_with(&src) {
            return Err(FsError::InvalidArgument(
                "target lies beneath source".to_owned(),
            ));
        }

        let src_meta = tokio::fs::symlink_metadata(&src)
            .await
            .map_err(|e| io_error(e, source))?;
        self.require_absent(&dst, target).await?;
        self.require_parent_dir(&dst, target).await?;

        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) && src_meta.is_file() => {
                warn!(%source, %target, "rename crosses filesystems, falling back to copy + delete");
                tokio::fs::copy(&src, &dst)
                    .await
                    .map_err(|e| io_error(e, target))?;
                tokio::fs::remove_file(&src)
                    .await
                    .map_err(|e| io_error(e, source))?;
                Ok(())
            }
            Err(e) => Err(io_error(e, source)),
        }
    }

    /// Copies a regular file byte-for-byte. Metadata is not preserved.
    pub async fn copy(&self, source: &str, target: &str) -> Result<(), FsError> {
        let src = self.root.resolve(source)?;
        let dst = self.root.resolve(target)?;

        let meta = tokio::fs::metadata(&src)
            .await
            .map_err(|e| io_error(e, source))?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory(source.to_owned()));
        }
        if !meta.is_file() {
            return Err(FsError::NotAFile(source.to_owned()));
        }
        self.require_absent(&dst, target).await?;
        self.require_parent_dir(&dst, target).await?;

        tokio::fs::copy(&src, &dst)
            .await
            .map_err(|e| io_error(e, target))?;
        Ok(())
    }

    /// Reads up to `length` bytes starting at `offset` and decodes them as
    /// UTF-8, best-effort: a window that cuts a multibyte sequence yields
    /// replacement characters at the edges. Callers wanting exact bytes must
    /// align their windows on character boundaries.
    pub async fn read(&self, path: &str, offset: u64, length: u64) -> Result<String, FsError> {
        if length > MAX_READ {
            return Err(FsError::InvalidArgument(format!(
                "length {length} exceeds the {MAX_READ}-byte read cap"
            )));
        }
        let abs = self.root.resolve(path)?;
        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| io_error(e, path))?;
        if !meta.is_file() {
            return Err(FsError::NotAFile(path.to_owned()));
        }
        let size = meta.len();
        if offset > size {
            return Err(FsError::InvalidArgument(format!(
                "offset {offset} beyond file size {size}"
            )));
        }
        let effective = length.min(size - offset);
        if effective == 0 {
            return Ok(String::new());
        }

        let mut file = tokio::fs::File::open(&abs)
            .await
            .map_err(|e| io_error(e, path))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error(e, path))?;
        let mut buf = Vec::with_capacity(effective as usize);
        file.take(effective)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| io_error(e, path))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Appends `data` to the file (creating it if absent) under the
    /// fleet-wide lease for that path, then flushes to durable storage.
    /// The lease is released on every exit branch; concurrent appends to
    /// one path never interleave.
    pub async fn append(
        &self,
        path: &str,
        data: &str,
        cancel: &CancellationToken,
    ) -> Result<(), FsError> {
        let abs = self.root.resolve(path)?;
        let key = format!("file:{}", self.root.relativize(&abs));
        let lease = self.locks.acquire(&key, cancel).await.map_err(FsError::Lock)?;
        let result = append_locked(&abs, data).await;
        lease.release().await;
        result.map_err(|e| io_error(e, path))
    }

    fn describe(&self, abs: &Utf8Path, size: u64) -> EntryDescriptor {
        EntryDescriptor {
            name: abs.file_name().unwrap_or_default().to_owned(),
            path: self.root.relativize(abs),
            size,
        }
    }

    async fn require_absent(&self, abs: &Utf8Path, path: &str) -> Result<(), FsError> {
        match tokio::fs::symlink_metadata(abs).await {
            Ok(_) => Err(FsError::AlreadyExists(path.to_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e, path)),
        }
    }

    async fn require_parent_dir(&self, abs: &Utf8Path, path: &str) -> Result<(), FsError> {
        // `abs` is under the root, so a parent always exists lexically.
        let Some(parent) = abs.parent() else {
            return Ok(());
        };
        match tokio::fs::metadata(parent).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(FsError::NotADirectory(path.to_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FsError::NotFound(path.to_owned()))
            }
            Err(e) => Err(io_error(e, path)),
        }
    }
}

async fn append_locked(abs: &Utf8Path, data: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(abs)
        .await?;
    file.write_all(data.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}
