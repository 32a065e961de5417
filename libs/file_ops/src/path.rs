//! Lexical path resolution against the configured root directory.
//!
//! Every caller-supplied path is joined under the root and normalized
//! without consulting the filesystem. The prefix check on the normalized
//! result is the security boundary; symlinks inside the root are left to
//! the filesystem to constrain (resolving them here would reintroduce
//! TOCTOU races for no gain on a root that is not attacker-writable).

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::FsError;

/// The absolute, canonicalized directory that bounds all file operations.
/// Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDir(Utf8PathBuf);

impl RootDir {
    /// Canonicalizes `path` and verifies it is an existing directory.
    pub fn new(path: &Utf8Path) -> anyhow::Result<Self> {
        let canonical = path
            .canonicalize_utf8()
            .map_err(|e| anyhow::anyhow!("root directory {path:?} is not accessible: {e}"))?;
        anyhow::ensure!(
            canonical.is_dir(),
            "root directory {canonical:?} is not a directory"
        );
        Ok(Self(canonical))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.0
    }

    /// Maps a caller path to an absolute path under the root.
    ///
    /// The caller path is always treated as relative, even when it starts
    /// with `/`. `.` and `..` segments are collapsed lexically; a result
    /// that does not stay under the root fails with [`FsError::PathEscape`].
    pub fn resolve(&self, caller_path: &str) -> Result<Utf8PathBuf, FsError> {
        if caller_path.trim().is_empty() {
            return Err(FsError::InvalidArgument(
                "path must not be empty or whitespace".to_owned(),
            ));
        }
        let joined = self.0.join(caller_path.trim_start_matches('/'));
        let normalized = lexical_normalize(&joined);
        if !normalized.starts_with(&self.0) {
            return Err(FsError::PathEscape(caller_path.to_owned()));
        }
        Ok(normalized)
    }

    /// The descriptor form of an absolute path: root-relative, `/`-separated,
    /// no leading `/` or `.`. The root itself maps to `""`.
    pub fn relativize(&self, abs_path: &Utf8Path) -> String {
        abs_path
            .strip_prefix(&self.0)
            .map(|rel| rel.as_str().to_owned())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for RootDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Collapses `.` and `..` components without touching the filesystem.
/// `..` at the filesystem root stays clamped there, like `cd /..`.
fn lexical_normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::Prefix(_) | Utf8Component::RootDir => out.push(component.as_str()),
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                out.pop();
            }
            Utf8Component::Normal(name) => out.push(name),
        }
    }
    out
}
