//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary.
//! Terminal prompts are disabled so an upstream asking for credentials
//! fails fast instead of hanging, and every child is killed when its
//! future is dropped so that timeouts and cancelled requests do not leave
//! stray processes behind.
//!
//! All functions are fully `async` and use the Tokio process runtime.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

fn git() -> Command {
    let mut cmd = Command::new("git");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.kill_on_drop(true);
    cmd
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// Run `git clone --mirror <url> <dest>`.
///
/// A mirror clone copies every ref and leaves the repository bare, ready to
/// be served by `upload-pack`.
#[instrument(fields(%url, dest = %dest.display()))]
pub async fn git_clone_mirror(url: &str, dest: &Path) -> Result<()> {
    let mut cmd = git();
    cmd.arg("clone")
        .arg("--mirror")
        .arg("--quiet")
        .arg(url)
        .arg(dest);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!("spawning git clone --mirror");

    let output = cmd
        .output()
        .await
        .context("failed to spawn git clone --mirror")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git clone --mirror failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git clone --mirror succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// ls-remote
// ---------------------------------------------------------------------------

/// Run `git ls-remote --symref <url> HEAD` and return its raw output.
///
/// The output names the branch `HEAD` points to (`ref: <target>\tHEAD`)
/// followed by the commit it resolves to.
#[instrument(fields(%url))]
pub async fn git_ls_remote_head(url: &str) -> Result<String> {
    let mut cmd = git();
    cmd.arg("ls-remote").arg("--symref").arg(url).arg("HEAD");

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!("spawning git ls-remote");

    let output = cmd
        .output()
        .await
        .context("failed to spawn git ls-remote")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git ls-remote failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    let stdout = String::from_utf8(output.stdout).context("git ls-remote output is not UTF-8")?;
    debug!(lines = stdout.lines().count(), "git ls-remote complete");
    Ok(stdout)
}

// ---------------------------------------------------------------------------
// Upload-pack
// ---------------------------------------------------------------------------

/// Run `git upload-pack --stateless-rpc --advertise-refs <repo_path>` and
/// return the reference advertisement.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_advertise_refs(repo_path: &Path) -> Result<Vec<u8>> {
    let mut cmd = git();
    cmd.arg("upload-pack")
        .arg("--stateless-rpc")
        .arg("--advertise-refs")
        .arg(repo_path);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .context("failed to spawn git upload-pack --advertise-refs")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git upload-pack --advertise-refs failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    Ok(output.stdout)
}

/// Spawn `git upload-pack --stateless-rpc <repo_path>` and return the
/// [`Child`] process handle.
///
/// The caller writes the client's negotiation to `child.stdin` and streams
/// `child.stdout` back, so pack data is never buffered in memory.
#[instrument(fields(repo = %repo_path.display()))]
pub fn git_upload_pack_streamed(repo_path: &Path) -> Result<Child> {
    let mut cmd = git();
    cmd.arg("upload-pack").arg("--stateless-rpc").arg(repo_path);

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());

    let child = cmd
        .spawn()
        .context("failed to spawn git upload-pack (streamed)")?;

    Ok(child)
}

/// Feed `input` to a streamed upload-pack child, then close its stdin.
pub async fn write_upload_pack_input(child: &mut Child, input: &[u8]) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .context("git upload-pack stdin already taken")?;
    stdin
        .write_all(input)
        .await
        .context("failed to write to git upload-pack stdin")?;
    stdin
        .shutdown()
        .await
        .context("failed to close git upload-pack stdin")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use super::*;

    /// Whether a usable `git` binary is on `PATH`.
    pub(crate) fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Create a work tree with one commit on `main`; returns its path and
    /// the commit id.
    pub(crate) fn seed_repo(root: &Path) -> (PathBuf, String) {
        let work = root.join("upstream");
        std::fs::create_dir_all(&work).unwrap();
        let run = |args: &[&str]| {
            let out = std::process::Command::new("git")
                .args(args)
                .current_dir(&work)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed: {out:?}");
            String::from_utf8(out.stdout).unwrap()
        };
        run(&["init", "--quiet"]);
        run(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(work.join("README"), "hello\n").unwrap();
        run(&["add", "README"]);
        run(&["commit", "--quiet", "-m", "initial"]);
        let head = run(&["rev-parse", "HEAD"]).trim().to_string();
        (work, head)
    }

    #[tokio::test]
    async fn ls_remote_reports_symbolic_head() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (work, head) = seed_repo(tmp.path());

        let out = git_ls_remote_head(&work.display().to_string())
            .await
            .unwrap();

        assert!(out.contains("ref: refs/heads/main\tHEAD"));
        assert!(out.contains(&head));
    }

    #[tokio::test]
    async fn ls_remote_fails_for_missing_repository() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");

        let err = git_ls_remote_head(&missing.display().to_string())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("git ls-remote failed"));
    }

    #[tokio::test]
    async fn mirror_clone_is_served_by_upload_pack() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (work, head) = seed_repo(tmp.path());
        let dest = tmp.path().join("mirror.git");

        git_clone_mirror(&work.display().to_string(), &dest)
            .await
            .unwrap();
        assert!(dest.join("HEAD").is_file());

        let advert = git_advertise_refs(&dest).await.unwrap();
        let advert = String::from_utf8_lossy(&advert);
        assert!(advert.contains(&head));
        assert!(advert.contains("refs/heads/main"));
    }

    #[tokio::test]
    async fn streamed_upload_pack_answers_flush_with_empty_output() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let (work, _) = seed_repo(tmp.path());
        let dest = tmp.path().join("mirror.git");
        git_clone_mirror(&work.display().to_string(), &dest)
            .await
            .unwrap();

        let mut child = git_upload_pack_streamed(&dest).unwrap();
        write_upload_pack_input(&mut child, b"0000").await.unwrap();
        let output = child.wait_with_output().await.unwrap();

        assert!(output.status.success());
    }
}
