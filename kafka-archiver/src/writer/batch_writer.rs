use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::compression::{CompressedWriter, CompressionType};
use crate::kafka::types::{FetchedRecord, PartitionKey};
use crate::metrics_const::BATCH_FILE_SIZE_HISTOGRAM;
use crate::utils::{destination_key, finished_path, staging_path};

/// Record separator appended after every payload
const SEPARATOR: &[u8] = b"\n";

/// Creation time of the most recent batch writer, in epoch millis
static LAST_CREATED_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Current time, bumped past the previous writer's creation time so that staging files and
/// destination keys never collide when batches rotate within the same millisecond.
fn unique_creation_time() -> DateTime<Utc> {
    let now = Utc::now();
    let mut wanted = now.timestamp_millis();
    let previous = LAST_CREATED_MILLIS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(wanted.max(last + 1))
    });
    if let Ok(last) = previous {
        wanted = wanted.max(last + 1);
    }
    DateTime::from_timestamp_millis(wanted).unwrap_or(now)
}

/// Settings shared by every batch writer of the process
#[derive(Debug, Clone)]
pub struct BatchWriterSettings {
    pub staging_dir: PathBuf,
    /// Payload bytes (plus one separator byte per record) a batch may hold
    pub capacity_bytes: i64,
    /// On-disk size at which a batch is flushed regardless of remaining capacity
    pub flush_threshold_bytes: u64,
    pub compression: CompressionType,
}

/// Counts the bytes that reach the file, after compression.
struct CountingWriter<W> {
    inner: W,
    bytes: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A flushed batch, ready to be handed to the upload sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBatch {
    pub path: PathBuf,
    pub destination_key: String,
    pub records: usize,
    pub size_bytes: u64,
}

/// Accumulates the records of one partition into a compressed staging file.
pub struct PartitionBatchWriter {
    partition: PartitionKey,
    remaining_capacity: i64,
    flush_threshold_bytes: u64,
    output: CompressedWriter<CountingWriter<BufWriter<File>>>,
    staging_path: PathBuf,
    destination_key: String,
    records: usize,
}

impl PartitionBatchWriter {
    /// Opens a new staging file. The destination key is fixed from the current time.
    pub fn create(partition: PartitionKey, settings: &BatchWriterSettings) -> Result<Self> {
        let created_at = unique_creation_time();
        let path = staging_path(
            &settings.staging_dir,
            partition.topic(),
            partition.partition_number(),
            created_at,
            settings.compression,
        );

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create staging directory: {parent:?}"))?;
        }
        let file =
            File::create(&path).with_context(|| format!("Failed to create batch file: {path:?}"))?;

        let output = settings.compression.wrap_writer(CountingWriter {
            inner: BufWriter::new(file),
            bytes: 0,
        });

        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Opened batch file {path:?}"
        );

        Ok(Self {
            destination_key: destination_key(
                partition.topic(),
                partition.partition_number(),
                created_at,
            ),
            partition,
            remaining_capacity: settings.capacity_bytes,
            flush_threshold_bytes: settings.flush_threshold_bytes,
            output,
            staging_path: path,
            records: 0,
        })
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn destination_key(&self) -> &str {
        &self.destination_key
    }

    pub fn remaining_capacity(&self) -> i64 {
        self.remaining_capacity
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Appends the payload and a separator. Capacity shrinks by the payload size plus one.
    pub fn add_record(&mut self, record: &FetchedRecord) -> io::Result<()> {
        self.output.write_all(record.payload())?;
        self.output.write_all(SEPARATOR)?;
        self.remaining_capacity -= record.serialized_size() as i64 + 1;
        self.records += 1;
        Ok(())
    }

    pub fn add_records(&mut self, records: &[FetchedRecord]) -> io::Result<()> {
        for record in records {
            self.add_record(record)?;
        }
        Ok(())
    }

    /// True once the batch is full. A batch may overshoot its capacity by up to one record.
    pub fn ready_for_commit(&self) -> bool {
        self.remaining_capacity <= 0 || self.output.get_ref().bytes >= self.flush_threshold_bytes
    }

    /// Finishes the compressed stream, syncs the file and renames it out of its in-progress
    /// name. A failed rename only loses the cosmetic name, so the staged path is kept.
    pub fn flush(self) -> Result<FlushedBatch> {
        let counting = self
            .output
            .finish()
            .with_context(|| format!("Failed to finish batch stream: {:?}", self.staging_path))?;
        let size_bytes = counting.bytes;
        let file = counting
            .inner
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("Failed to flush batch file: {:?}", self.staging_path))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync batch file: {:?}", self.staging_path))?;
        drop(file);

        let target = finished_path(&self.staging_path);
        let path = match fs::rename(&self.staging_path, &target) {
            Ok(()) => target,
            Err(e) => {
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    "Failed to rename {:?} to {target:?}, uploading under the staged name: {e}",
                    self.staging_path
                );
                self.staging_path
            }
        };

        metrics::histogram!(BATCH_FILE_SIZE_HISTOGRAM).record(size_bytes as f64);

        Ok(FlushedBatch {
            path,
            destination_key: self.destination_key,
            records: self.records,
            size_bytes,
        })
    }
}
