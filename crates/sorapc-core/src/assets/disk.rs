//! On-disk cache of encoded image bytes.
//!
//! Files are named by the SHA-256 of the URI and pruned oldest-first once the
//! directory grows past its budget.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::Result;

#[derive(Debug, Clone)]
pub(crate) struct DiskCache {
    dir: PathBuf,
    budget_bytes: u64,
}

impl DiskCache {
    pub(crate) const fn new(dir: PathBuf, budget_bytes: u64) -> Self {
        Self { dir, budget_bytes }
    }

    fn path_for(&self, uri: &str) -> PathBuf {
        self.dir.join(format!("{:x}", Sha256::digest(uri.as_bytes())))
    }

    /// Cached bytes for a URI, if present.
    pub(crate) async fn read(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(uri)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store bytes for a URI, then prune to the budget.
    pub(crate) async fn write(&self, uri: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(uri);
        let partial = path.with_extension("part");
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, &path).await?;

        self.prune().await
    }

    /// Drop an entry that turned out to be unusable.
    pub(crate) async fn remove(&self, uri: &str) {
        if let Err(e) = tokio::fs::remove_file(self.path_for(uri)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(%uri, "Failed to remove cached image: {e}");
            }
        }
    }

    /// Delete the oldest files until the directory fits the budget.
    pub(crate) async fn prune(&self) -> Result<()> {
        let mut files = Vec::new();
        let mut total = 0_u64;

        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            total += metadata.len();
            files.push((modified, metadata.len(), entry.path()));
        }

        if total <= self.budget_bytes {
            return Ok(());
        }

        files.sort();
        for (_, len, path) in files {
            if total <= self.budget_bytes {
                break;
            }
            remove_quietly(&path).await;
            total = total.saturating_sub(len);
            debug!(path = %path.display(), "Pruned cached image");
        }

        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), "Failed to prune cached image: {e}");
    }
}
