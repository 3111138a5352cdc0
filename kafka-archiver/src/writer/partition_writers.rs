use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::kafka::types::PartitionKey;
use crate::metrics_const::{BATCHES_FLUSHED_COUNTER, OPEN_BATCH_WRITERS_GAUGE};
use crate::upload::UploadSink;
use crate::writer::batch_writer::{BatchWriterSettings, PartitionBatchWriter};

/// Process-wide set of open batch writers, at most one per partition.
///
/// A writing task checks its partition's writer out for the duration of its run and checks it
/// back in before signalling completion, so a writer is only ever touched by one thread. The
/// writer outlives the task and the consumer that owns the partition: a partition reassigned
/// within the process keeps appending to the same batch.
pub struct PartitionWriters {
    writers: DashMap<PartitionKey, PartitionBatchWriter>,
    settings: BatchWriterSettings,
    sink: Arc<dyn UploadSink>,
}

impl PartitionWriters {
    pub fn new(settings: BatchWriterSettings, sink: Arc<dyn UploadSink>) -> Self {
        Self {
            writers: DashMap::new(),
            settings,
            sink,
        }
    }

    pub fn settings(&self) -> &BatchWriterSettings {
        &self.settings
    }

    pub fn checkout(&self, partition: &PartitionKey) -> Option<PartitionBatchWriter> {
        self.writers.remove(partition).map(|(_, writer)| writer)
    }

    /// Returns a writer to the set. A writer is never replaced: when the partition already has
    /// an open writer again, the one checked in is flushed and submitted on its own.
    pub fn checkin(&self, writer: PartitionBatchWriter) {
        let partition = writer.partition().clone();
        let rejected = match self.writers.entry(partition.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(writer);
                None
            }
            Entry::Occupied(_) => Some(writer),
        };

        if let Some(writer) = rejected {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                records = writer.record_count(),
                "Partition already has an open batch, flushing {} separately",
                writer.destination_key()
            );
            if let Err(e) = self.flush_and_submit(writer) {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Failed to flush duplicate batch: {e:#}"
                );
            }
        }
        self.update_gauge();
    }

    pub fn open(&self, partition: &PartitionKey) -> Result<PartitionBatchWriter> {
        PartitionBatchWriter::create(partition.clone(), &self.settings)
            .with_context(|| format!("Failed to open batch writer for {partition}"))
    }

    /// Flushes the writer and hands the file to the upload sink
    pub fn flush_and_submit(&self, writer: PartitionBatchWriter) -> Result<()> {
        let partition = writer.partition().clone();
        let batch = writer
            .flush()
            .with_context(|| format!("Failed to flush batch for {partition}"))?;

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            records = batch.records,
            size_bytes = batch.size_bytes,
            "Flushed batch {}",
            batch.destination_key
        );
        metrics::counter!(BATCHES_FLUSHED_COUNTER).increment(1);

        self.sink.submit(batch.path, batch.destination_key);
        Ok(())
    }

    /// Flushes the partially filled batches of the given partitions. Partitions without an open
    /// writer are skipped.
    pub fn flush_partitions(&self, partitions: &[PartitionKey]) {
        for partition in partitions {
            if let Some(writer) = self.checkout(partition) {
                if let Err(e) = self.flush_and_submit(writer) {
                    error!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "Failed to flush partial batch: {e:#}"
                    );
                }
            }
        }
        self.update_gauge();
    }

    pub fn flush_all(&self) {
        let partitions: Vec<PartitionKey> =
            self.writers.iter().map(|entry| entry.key().clone()).collect();
        info!("Flushing {} open batches", partitions.len());
        self.flush_partitions(&partitions);
    }

    pub fn open_count(&self) -> usize {
        self.writers.len()
    }

    pub fn contains(&self, partition: &PartitionKey) -> bool {
        self.writers.contains_key(partition)
    }

    fn update_gauge(&self) {
        metrics::gauge!(OPEN_BATCH_WRITERS_GAUGE).set(self.writers.len() as f64);
    }
}
