//! Bare Git repository validation.

use std::path::Path;

use tracing::{debug, instrument};

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Check whether `path` looks like a complete bare Git repository.
///
/// A bare repo must be a directory holding a `HEAD` file and both the
/// `objects` and `refs` directories.  This is a structural check, not an
/// integrity check of the object store.
#[instrument(fields(path = %path.display()))]
pub async fn validate_bare_repo(path: &Path) -> bool {
    if !is_dir(path).await {
        debug!("path does not exist or is not a directory");
        return false;
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);

    if !head_exists {
        debug!("HEAD file not found; not a valid bare repo");
        return false;
    }

    if !is_dir(&path.join("objects")).await || !is_dir(&path.join("refs")).await {
        debug!("objects/ or refs/ directory is missing");
        return false;
    }

    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
