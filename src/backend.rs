//! The two backend surfaces TreeStore consumes: a POSIX-like filesystem and
//! an abstract remote object store. Concrete remote APIs (a specific cloud
//! vendor's HTTP client) are out of scope; only the trait is modeled.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// What `LocalFs::stat` reports about a path, trimmed down from
/// `tree::PosixMetadata` to the fields TreeStore actually projects onto a
/// `Node`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StatInfo {
    pub is_dir: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    pub size_bytes: u64,
    pub modified: SystemTime,
    pub created: SystemTime,
}

/// The local filesystem surface `LocalTreeStore` scans and mutates.
/// Abstracted behind a trait (rather than calling `std::fs` directly) so
/// tests can swap in an in-memory double.
pub trait LocalFs {
    fn stat(&self, path: &Utf8Path) -> Result<Option<StatInfo>>;
    fn listdir(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;
    fn is_dir(&self, path: &Utf8Path) -> bool;
    fn is_file(&self, path: &Utf8Path) -> bool;
    fn readlink(&self, path: &Utf8Path) -> Result<Option<Utf8PathBuf>>;
    fn exists(&self, path: &Utf8Path) -> bool;
    fn mkdir(&self, path: &Utf8Path) -> Result<()>;
    fn remove_file(&self, path: &Utf8Path) -> Result<()>;
    fn remove_dir(&self, path: &Utf8Path) -> Result<()>;
    /// Atomic where the OS allows it (same-filesystem rename); callers fall
    /// back to copy+remove across filesystems the way `file_util::move_opened`
    /// does for `EXDEV`.
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()>;
}

/// A real POSIX filesystem. Mirrors `backend/fs.rs`'s thin wrapper shape -
/// path manipulation plus direct passthrough to `std::fs`.
pub struct RealLocalFs;

impl RealLocalFs {
    fn to_std(p: &Utf8Path) -> PathBuf {
        PathBuf::from(p.as_str())
    }
}

impl LocalFs for RealLocalFs {
    fn stat(&self, path: &Utf8Path) -> Result<Option<StatInfo>> {
        let std_path = Self::to_std(path);
        match fs::symlink_metadata(&std_path) {
            Ok(meta) => {
                let file_type = meta.file_type();
                Ok(Some(StatInfo {
                    is_dir: file_type.is_dir(),
                    is_file: file_type.is_file(),
                    is_symlink: file_type.is_symlink(),
                    size_bytes: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    created: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Couldn't stat {path}")),
        }
    }

    fn listdir(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(Self::to_std(path))
            .with_context(|| format!("Couldn't list {path}"))?
        {
            let entry = entry?;
            let child = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|p| anyhow::anyhow!("Non-UTF-8 path: {}", p.display()))?;
            out.push(child);
        }
        Ok(out)
    }

    fn is_dir(&self, path: &Utf8Path) -> bool {
        Path::new(path.as_str()).is_dir()
    }

    fn is_file(&self, path: &Utf8Path) -> bool {
        Path::new(path.as_str()).is_file()
    }

    fn readlink(&self, path: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
        match fs::read_link(Self::to_std(path)) {
            Ok(target) => Ok(Some(
                Utf8PathBuf::from_path_buf(target)
                    .map_err(|p| anyhow::anyhow!("Non-UTF-8 symlink target: {}", p.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(None), // not a symlink
            Err(e) => Err(e).with_context(|| format!("Couldn't read link {path}")),
        }
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        Path::new(path.as_str()).exists()
    }

    fn mkdir(&self, path: &Utf8Path) -> Result<()> {
        fs::create_dir_all(Self::to_std(path)).with_context(|| format!("Couldn't mkdir {path}"))
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<()> {
        fs::remove_file(Self::to_std(path)).with_context(|| format!("Couldn't remove {path}"))
    }

    fn remove_dir(&self, path: &Utf8Path) -> Result<()> {
        fs::remove_dir_all(Self::to_std(path))
            .with_context(|| format!("Couldn't remove dir {path}"))
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        fs::rename(Self::to_std(from), Self::to_std(to))
            .with_context(|| format!("Couldn't rename {from} to {to}"))
    }
}

/// One entry returned by `RemoteClient::list_children` or `changes_list`.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub remote_id: String,
    pub parent_remote_ids: Vec<String>,
    pub name: String,
    pub is_folder: bool,
    pub size_bytes: u64,
    pub modified: SystemTime,
    pub trashed: bool,
}

/// A page of `changes_list`: entries plus the token to resume from next time.
#[derive(Debug, Clone)]
pub struct ChangesPage {
    pub entries: Vec<RemoteEntry>,
    pub next_start_token: Option<String>,
}

/// The abstract remote backend surface. No concrete vendor implementation
/// ships with this crate - only the trait, so `RemoteTreeStore` has
/// something to compile against and tests can supply a fake.
pub trait RemoteClient {
    fn list_children(&self, remote_id: &str) -> Result<Vec<RemoteEntry>>;
    fn get_by_id(&self, remote_id: &str) -> Result<Option<RemoteEntry>>;
    fn create_folder(&self, parent_remote_id: &str, name: &str) -> Result<RemoteEntry>;
    fn upload_file(
        &self,
        parent_remote_id: &str,
        name: &str,
        content: &mut dyn std::io::Read,
    ) -> Result<RemoteEntry>;
    /// Renames and/or reparents an existing remote entry. Covers both
    /// `Mv` (new parent, same or new name) and a plain rename (new name,
    /// same parent) since most remote object stores fold both into one
    /// metadata-update call.
    fn modify_meta(
        &self,
        remote_id: &str,
        new_parent_remote_id: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<RemoteEntry>;
    fn trash(&self, remote_id: &str) -> Result<()>;
    fn hard_delete(&self, remote_id: &str) -> Result<()>;
    /// Opaque token a caller stashes and passes back into `changes_list` to
    /// resume a change feed from "now".
    fn changes_start_token(&self) -> Result<String>;
    fn changes_list(&self, start_token: &str) -> Result<ChangesPage>;
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn real_local_fs_round_trips_a_directory() -> Result<()> {
        let dir = tempdir()?;
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let fs_iface = RealLocalFs;
        let sub = base.join("child");
        fs_iface.mkdir(&sub)?;
        assert!(fs_iface.is_dir(&sub));
        let listed = fs_iface.listdir(&base)?;
        assert_eq!(listed, vec![sub]);
        Ok(())
    }

    #[test]
    fn stat_missing_path_is_none() -> Result<()> {
        let dir = tempdir()?;
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let fs_iface = RealLocalFs;
        assert!(fs_iface.stat(&base.join("nope"))?.is_none());
        Ok(())
    }
}
