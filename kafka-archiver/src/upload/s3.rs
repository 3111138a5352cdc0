use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use aws_config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion, Region};
use aws_sdk_s3::Client;
use tokio::fs;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics_const::{UPLOADS_COUNTER, UPLOADS_IN_FLIGHT_GAUGE, UPLOAD_DURATION_HISTOGRAM};
use crate::upload::UploadSink;

pub async fn create_s3_client(config: &Config) -> Client {
    let timeout_config = TimeoutConfig::builder()
        .operation_timeout(config.s3_timeout())
        .build();

    let shared_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.aws_region.clone()))
        .load()
        .await;

    let mut builder = aws_sdk_s3::config::Builder::from(&shared_config)
        .timeout_config(timeout_config)
        .retry_config(RetryConfig::adaptive())
        .force_path_style(config.s3_force_path_style);

    if let Some(ref endpoint) = config.s3_endpoint {
        info!("Using custom S3 endpoint {endpoint}");
        builder = builder.endpoint_url(endpoint);
    }

    Client::from_conf(builder.build())
}

/// Uploads flushed batches to S3 from the tokio runtime.
///
/// Writer threads are not async, so uploads are spawned onto the runtime the sink was created
/// on. A semaphore bounds how many run at once; the staged file is deleted after a successful
/// upload and left in place for inspection otherwise.
pub struct S3UploadSink {
    client: Client,
    bucket: String,
    handle: Handle,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl S3UploadSink {
    /// Must be called from within a tokio runtime
    pub async fn new(config: &Config, bucket: String) -> Result<Self> {
        let client = create_s3_client(config).await;

        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .with_context(|| {
                format!(
                    "S3 bucket validation failed for '{}' in region '{}'. Check credentials and bucket access.",
                    bucket, config.aws_region
                )
            })?;
        info!(
            "S3 bucket '{}' validated successfully in region '{}'",
            bucket, config.aws_region
        );

        Ok(Self {
            client,
            bucket,
            handle: Handle::current(),
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(config.upload_concurrency)),
        })
    }
}

async fn upload_file(client: &Client, bucket: &str, local_path: &Path, key: &str) -> Result<()> {
    let body = fs::read(local_path)
        .await
        .with_context(|| format!("Failed to read file: {local_path:?}"))?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body.into())
        .send()
        .await
        .with_context(|| format!("Failed to upload to S3 key: {key}"))?;

    info!("Uploaded file {local_path:?} to s3://{bucket}/{key}");
    Ok(())
}

impl UploadSink for S3UploadSink {
    fn submit(&self, file: PathBuf, destination_key: String) {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let permits = self.permits.clone();

        self.tracker.spawn_on(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    warn!("Upload sink closed, leaving {file:?} staged");
                    return;
                };

                metrics::gauge!(UPLOADS_IN_FLIGHT_GAUGE).increment(1.0);
                let start = Instant::now();
                let result = upload_file(&client, &bucket, &file, &destination_key).await;
                metrics::gauge!(UPLOADS_IN_FLIGHT_GAUGE).decrement(1.0);
                metrics::histogram!(UPLOAD_DURATION_HISTOGRAM)
                    .record(start.elapsed().as_secs_f64());

                match result {
                    Ok(()) => {
                        metrics::counter!(UPLOADS_COUNTER, "status" => "success").increment(1);
                        if let Err(e) = fs::remove_file(&file).await {
                            warn!("Failed to remove uploaded file {file:?}: {e}");
                        }
                    }
                    Err(e) => {
                        metrics::counter!(UPLOADS_COUNTER, "status" => "failure").increment(1);
                        error!(
                            "Upload of {file:?} to s3://{bucket}/{destination_key} failed: {e:#}"
                        );
                    }
                }
            },
            &self.handle,
        );
    }

    /// Blocks the calling thread, so it must not be called from an async context
    fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.tracker.close();
        info!("Waiting for {} uploads to finish", self.tracker.len());

        let tracker = self.tracker.clone();
        self.handle
            .block_on(tokio::time::timeout(timeout, tracker.wait()))
            .map_err(|_| {
                anyhow!(
                    "Timed out after {timeout:?} with {} uploads still running",
                    self.tracker.len()
                )
            })
    }
}
