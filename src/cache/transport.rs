//! Contract for the service that physically materializes mirrors.

use std::path::Path;

use anyhow::Result;

/// Produces, recognizes and discards local mirrors.
#[async_trait::async_trait]
pub trait MirrorTransport: Send + Sync {
    /// Full mirror clone of `url` into `dest`, which must not exist yet.
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()>;

    /// Whether `path` holds a mirror the transport can serve from.
    async fn is_valid_mirror(&self, path: &Path) -> bool;

    /// Delete whatever is at `path`.  A missing path is not an error.
    async fn remove_mirror(&self, path: &Path) -> std::io::Result<()> {
        super::layout::remove_path(path).await
    }
}
