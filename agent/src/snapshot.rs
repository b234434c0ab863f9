use std::path::{Path, PathBuf};

use tracing::debug;

/// Keeps the most recent significant frame on local disk, overwriting the
/// previous one. Nothing reads it back; it is an artifact for operators.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `jpeg`, creating the parent directory on first use.
    pub async fn write(&self, jpeg: &[u8]) -> Result<(), SnapshotError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SnapshotError::CreateDir(dir.display().to_string(), e))?;
        }

        // Write to a sibling temp file and rename so readers never see a torn JPEG.
        let tmp = self.path.with_extension("jpg.tmp");
        tokio::fs::write(&tmp, jpeg)
            .await
            .map_err(|e| SnapshotError::Write(tmp.display().to_string(), e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SnapshotError::Write(self.path.display().to_string(), e))?;

        debug!(path = self.path.display().to_string(), bytes = jpeg.len(), "stored snapshot");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to create snapshot directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to write snapshot {0}: {1}")]
    Write(String, std::io::Error),
}
