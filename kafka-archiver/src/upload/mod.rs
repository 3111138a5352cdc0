use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

pub mod local;
pub mod s3;

pub use local::LocalDirectorySink;
pub use s3::S3UploadSink;

/// Destination for flushed batch files.
///
/// `submit` is fire-and-forget: it must not block the writer thread on the transfer, and it owns
/// the file from then on. A failed upload is logged by the sink and never reported back to the
/// writer, whose offsets are already eligible for commit.
pub trait UploadSink: Send + Sync {
    fn submit(&self, file: PathBuf, destination_key: String);

    /// Waits up to `timeout` for submitted files to be transferred. Called once, after the
    /// last `submit`.
    fn shutdown(&self, timeout: Duration) -> Result<()>;
}
