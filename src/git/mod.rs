//! Git command wrappers and bare repository checks.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.  [`GitCli`] adapts them to the cache's
//! [`RemoteProber`] and [`MirrorTransport`] seams.

pub mod bare_repo;
pub mod commands;

use std::path::Path;

use anyhow::Result;

pub use bare_repo::validate_bare_repo;
pub use commands::{
    git_advertise_refs, git_clone_mirror, git_ls_remote_head, git_upload_pack_streamed,
    write_upload_pack_input,
};

use crate::cache::probe::{parse_advertisement, resolve_default_head};
use crate::cache::{MirrorTransport, ProbeError, RemoteProber};

/// Prober and transport backed by the system `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCli;

#[async_trait::async_trait]
impl RemoteProber for GitCli {
    async fn probe(&self, url: &str) -> Result<String, ProbeError> {
        let output = git_ls_remote_head(url)
            .await
            .map_err(|source| ProbeError::RemoteUnreachable {
                url: url.to_string(),
                source,
            })?;

        resolve_default_head(&parse_advertisement(&output)).ok_or_else(|| {
            ProbeError::NoDefaultRef {
                url: url.to_string(),
            }
        })
    }
}

#[async_trait::async_trait]
impl MirrorTransport for GitCli {
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()> {
        git_clone_mirror(url, dest).await
    }

    async fn is_valid_mirror(&self, path: &Path) -> bool {
        validate_bare_repo(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::commands::tests::{git_available, seed_repo};
    use super::*;

    #[tokio::test]
    async fn probe_resolves_default_branch() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (work, head) = seed_repo(tmp.path());

        let probed = GitCli.probe(&work.display().to_string()).await.unwrap();

        assert_eq!(probed, head);
    }

    #[tokio::test]
    async fn probe_of_empty_repository_has_no_default_ref() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let empty = tmp.path().join("empty.git");
        let status = std::process::Command::new("git")
            .args(["init", "--bare", "--quiet"])
            .arg(&empty)
            .status()
            .unwrap();
        assert!(status.success());

        let err = GitCli
            .probe(&empty.display().to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::NoDefaultRef { .. }));
    }

    #[tokio::test]
    async fn probe_of_missing_remote_is_unreachable() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();

        let err = GitCli
            .probe(&tmp.path().join("missing").display().to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::RemoteUnreachable { .. }));
    }

    #[tokio::test]
    async fn cloned_mirror_is_valid() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (work, _) = seed_repo(tmp.path());
        let dest = tmp.path().join("alice").join("repo1.git");

        GitCli
            .clone_mirror(&work.display().to_string(), &dest)
            .await
            .unwrap();

        assert!(GitCli.is_valid_mirror(&dest).await);
    }
}
