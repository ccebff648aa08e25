//! Checkpoint stores persist exactly one [Watermark] under a backend specific key. A checkpoint is
//! read once at the start of a tick and replaced once at the end of a successful tick.

use crate::config::CheckpointSettings;
use crate::error::{Error, Result};
use crate::watermark::{LookBack, Watermark};
use tracing::info;

/// Local file system backend, one file holding one timestamp.
mod file;
pub use file::FileCheckpointStore;

/// Object storage backend, one S3 object holding one timestamp.
mod s3;
pub use s3::S3CheckpointStore;

/// CheckpointStore is the interface between the orchestrator and the durable watermark. Stores do
/// no caching, every read goes to the backend so out-of-process edits and fail-over to another
/// instance are picked up on the next tick.
#[trait_variant::make(Send)]
pub trait CheckpointStore {
    /// Human readable location of the checkpoint (file path or `s3://bucket/key`).
    fn key(&self) -> &str;

    /// Returns the raw persisted value, or `None` if nothing has been persisted yet.
    async fn read(&self) -> Result<Option<String>>;

    /// Replaces the persisted value. A concurrent reader must never observe a partial write.
    async fn store(&self, watermark: Watermark) -> Result<()>;
}

/// Loads the watermark a tick starting at `now` should query from.
///
/// A missing or empty checkpoint is a first run and starts at the oldest allowed point. A value
/// that does not parse is an error, it is never silently replaced. A parsed value older than the
/// max look-back is clamped up to `now - max_look_back`.
pub async fn load<C: CheckpointStore>(
    store: &C,
    look_back: &LookBack,
    now: Watermark,
) -> Result<Watermark> {
    let persisted = match store.read().await? {
        Some(value) if !value.trim().is_empty() => {
            let watermark = value
                .parse::<Watermark>()
                .map_err(|e| Error::CorruptCheckpoint {
                    key: store.key().to_string(),
                    value,
                    reason: e.to_string(),
                })?;
            Some(watermark)
        }
        _ => {
            info!(
                key = store.key(),
                "No checkpoint found, starting from the max look-back"
            );
            None
        }
    };

    Ok(look_back.resolve(persisted, now))
}

/// The checkpoint backend chosen once at startup.
pub enum CheckpointBackend {
    File(FileCheckpointStore),
    S3(S3CheckpointStore),
}

impl CheckpointBackend {
    pub async fn from_settings(settings: &CheckpointSettings) -> Result<Self> {
        match settings {
            CheckpointSettings::File { path } => {
                Ok(CheckpointBackend::File(FileCheckpointStore::new(path)))
            }
            CheckpointSettings::S3 {
                bucket,
                key,
                region,
                endpoint_url,
            } => {
                let client = s3::create_s3_client(region.clone(), endpoint_url.clone()).await;
                Ok(CheckpointBackend::S3(S3CheckpointStore::new(
                    client,
                    bucket.clone(),
                    key.clone(),
                )?))
            }
        }
    }
}

impl CheckpointStore for CheckpointBackend {
    fn key(&self) -> &str {
        match self {
            CheckpointBackend::File(store) => store.key(),
            CheckpointBackend::S3(store) => store.key(),
        }
    }

    async fn read(&self) -> Result<Option<String>> {
        match self {
            CheckpointBackend::File(store) => store.read().await,
            CheckpointBackend::S3(store) => store.read().await,
        }
    }

    async fn store(&self, watermark: Watermark) -> Result<()> {
        match self {
            CheckpointBackend::File(store) => store.store(watermark).await,
            CheckpointBackend::S3(store) => store.store(watermark).await,
        }
    }
}
