//! On-disk placement of repository mirrors.
//!
//! Mirrors are stored as bare Git repositories under
//! `{base_path}/{owner}/{name}.git`.  A clone in progress lives next to its
//! final location as `{name}.git.partial` and is renamed into place only
//! once it completed.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::store::RepoKey;

const STAGING_SUFFIX: &str = ".partial";

/// Maps repository keys onto mirror directories.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    /// Root directory for mirrors (e.g. `/var/cache/mirrorcache/repos`).
    pub base_path: PathBuf,
}

impl MirrorLayout {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Return the mirror directory for `key`.
    pub fn repo_path(&self, key: &RepoKey) -> PathBuf {
        self.base_path
            .join(key.owner())
            .join(format!("{}.git", key.name()))
    }

    /// List all `owner/name` keys that currently have a mirror directory.
    ///
    /// Staging directories and entries that do not form a valid key are
    /// skipped.
    pub fn list_mirrors(&self) -> Result<Vec<RepoKey>> {
        let mut keys = Vec::new();

        if !self.base_path.exists() {
            return Ok(keys);
        }

        let owners = std::fs::read_dir(&self.base_path).with_context(|| {
            format!(
                "failed to read mirror directory: {}",
                self.base_path.display()
            )
        })?;

        for owner_entry in owners {
            let owner_entry = owner_entry?;
            if !owner_entry.file_type()?.is_dir() {
                continue;
            }
            let owner_name = owner_entry.file_name();
            let owner_str = owner_name.to_string_lossy();

            for repo_entry in std::fs::read_dir(owner_entry.path())? {
                let repo_entry = repo_entry?;
                if !repo_entry.file_type()?.is_dir() {
                    continue;
                }
                let repo_name = repo_entry.file_name();
                let Some(name) = repo_name.to_string_lossy().strip_suffix(".git").map(str::to_owned)
                else {
                    continue;
                };
                if let Ok(key) = RepoKey::new(owner_str.to_string(), name) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Sibling directory a mirror is cloned into before being moved to `dest`.
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("mirror"));
    name.push(STAGING_SUFFIX);
    dest.with_file_name(name)
}

/// Remove a mirror directory, a staging directory or a stray file.
///
/// A missing path is not an error.
pub async fn remove_path(path: &Path) -> std::io::Result<()> {
    let removed = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };

    match removed {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
