use crate::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::watermark::Watermark;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    location: String,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let location = path.display().to_string();
        Self { path, location }
    }

    /// The temporary file lives next to the checkpoint so the final rename never crosses a file
    /// system boundary.
    fn tmp_path(&self) -> PathBuf {
        let mut file_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        file_name.push(".tmp");
        self.path.with_file_name(file_name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn key(&self) -> &str {
        &self.location
    }

    async fn read(&self) -> Result<Option<String>> {
        match fs::read(&self.path).await {
            Ok(contents) => String::from_utf8(contents)
                .map(Some)
                .map_err(|e| Error::CorruptCheckpoint {
                    key: self.location.clone(),
                    value: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    reason: e.to_string(),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Checkpoint(format!(
                "Failed to read checkpoint file {}: {e}",
                self.location
            ))),
        }
    }

    async fn store(&self, watermark: Watermark) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::Checkpoint(format!(
                    "Failed to create checkpoint directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let tmp_path = self.tmp_path();
        write_synced(&tmp_path, watermark.to_string().as_bytes())
            .await
            .map_err(|e| {
                Error::Checkpoint(format!(
                    "Failed to write checkpoint file {}: {e}",
                    tmp_path.display()
                ))
            })?;

        // atomically replace the checkpoint, readers see either the old or the new value
        fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            Error::Checkpoint(format!(
                "Failed to replace checkpoint file {}: {e}",
                self.location
            ))
        })?;

        debug!(key = %self.location, %watermark, "Checkpoint stored");
        Ok(())
    }
}

async fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}
