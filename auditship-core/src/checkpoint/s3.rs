use crate::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::watermark::Watermark;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

const DEFAULT_REGION: &str = "us-east-1";

/// Creates the S3 client from the default AWS provider chain, with an optional region and endpoint
/// override (MinIO, LocalStack).
pub(crate) async fn create_s3_client(region: Option<String>, endpoint_url: Option<String>) -> Client {
    let region_provider = RegionProviderChain::first_try(region.map(Region::new))
        .or_default_provider()
        .or_else(Region::new(DEFAULT_REGION));

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
    if let Some(endpoint_url) = &endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }
    let shared_config = loader.load().await;

    info!(
        region = ?shared_config.region(),
        endpoint_url = ?endpoint_url,
        "Creating S3 client for checkpoints"
    );

    // custom endpoints rarely support virtual-hosted buckets
    let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
        .force_path_style(endpoint_url.is_some())
        .build();
    Client::from_conf(s3_config)
}

/// Stores the watermark as a single object. A `PutObject` replaces the whole object atomically.
#[derive(Debug, Clone)]
pub struct S3CheckpointStore {
    client: Client,
    bucket: String,
    object_key: String,
    location: String,
}

impl S3CheckpointStore {
    pub fn new(client: Client, bucket: impl Into<String>, object_key: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        let object_key = object_key.into();
        if bucket.trim().is_empty() {
            return Err(Error::Config("checkpoint bucket is empty".to_string()));
        }
        if object_key.trim().is_empty() {
            return Err(Error::Config("checkpoint object key is empty".to_string()));
        }
        let location = format!("s3://{bucket}/{object_key}");

        Ok(Self {
            client,
            bucket,
            object_key,
            location,
        })
    }
}

impl CheckpointStore for S3CheckpointStore {
    fn key(&self) -> &str {
        &self.location
    }

    async fn read(&self) -> Result<Option<String>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.object_key)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(Error::Checkpoint(format!(
                    "Failed to get checkpoint object {}: {}",
                    self.location,
                    DisplayErrorContext(&e)
                )));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| {
                Error::Checkpoint(format!(
                    "Failed to read checkpoint object body {}: {e}",
                    self.location
                ))
            })?
            .into_bytes();

        String::from_utf8(body.to_vec())
            .map(Some)
            .map_err(|e| Error::CorruptCheckpoint {
                key: self.location.clone(),
                value: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                reason: e.to_string(),
            })
    }

    async fn store(&self, watermark: Watermark) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.object_key)
            .content_type("text/plain")
            .body(ByteStream::from(watermark.to_string().into_bytes()))
            .send()
            .await
            .map_err(|e| {
                Error::Checkpoint(format!(
                    "Failed to put checkpoint object {}: {}",
                    self.location,
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(key = %self.location, %watermark, "Checkpoint stored");
        Ok(())
    }
}
