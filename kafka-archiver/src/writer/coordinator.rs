use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::kafka::types::{
    ConsumerId, FetchedRecord, OffsetAndMetadata, PartitionKey, PendingOffsets,
};
use crate::metrics_const::TASKS_SUBMITTED_COUNTER;
use crate::upload::UploadSink;
use crate::writer::batch_writer::BatchWriterSettings;
use crate::writer::partition_writers::PartitionWriters;
use crate::writer::task::{TaskHandle, WritingTask};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// The partition should have been paused until its previous task was harvested
    #[error("partition {partition} already has a task registered for consumer {consumer_id}")]
    PartitionBusy {
        consumer_id: ConsumerId,
        partition: PartitionKey,
    },

    #[error("no records submitted for partition {0}")]
    Empty(PartitionKey),
}

/// A harvested task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedWrite {
    pub partition: PartitionKey,
    /// Final watermark, or -1 after abnormal termination
    pub result: i64,
    pub first_offset: i64,
    pub end_offset: i64,
}

impl FinishedWrite {
    /// Offset to commit for this write, if it made progress
    pub fn offset(&self) -> Option<OffsetAndMetadata> {
        (self.result > 0).then(|| OffsetAndMetadata::new(self.result))
    }

    /// True when some of the submitted records were never written
    pub fn is_short(&self) -> bool {
        self.result < self.end_offset
    }

    /// Where the partition must be fetched from again to pick up the unwritten records
    pub fn resume_offset(&self) -> i64 {
        self.result.max(self.first_offset)
    }
}

/// Writing tasks registered per consumer. A partition has at most one task registered for a
/// consumer until that task is harvested or revoked.
#[derive(Default)]
pub struct ActiveTaskTable {
    tasks: DashMap<ConsumerId, HashMap<PartitionKey, TaskHandle>>,
}

impl ActiveTaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, consumer_id: ConsumerId, handle: TaskHandle) -> Result<(), SubmitError> {
        let mut tasks = self.tasks.entry(consumer_id).or_default();
        if tasks.contains_key(handle.partition()) {
            return Err(SubmitError::PartitionBusy {
                consumer_id,
                partition: handle.partition().clone(),
            });
        }
        tasks.insert(handle.partition().clone(), handle);
        Ok(())
    }

    pub fn get(&self, consumer_id: ConsumerId, partition: &PartitionKey) -> Option<TaskHandle> {
        self.tasks
            .get(&consumer_id)
            .and_then(|tasks| tasks.get(partition).cloned())
    }

    /// Removes and returns the finished tasks of a consumer
    pub fn take_finished(&self, consumer_id: ConsumerId) -> Vec<TaskHandle> {
        let Some(mut tasks) = self.tasks.get_mut(&consumer_id) else {
            return Vec::new();
        };
        let finished: Vec<PartitionKey> = tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(partition, _)| partition.clone())
            .collect();
        finished
            .iter()
            .filter_map(|partition| tasks.remove(partition))
            .collect()
    }

    pub fn remove(&self, consumer_id: ConsumerId, partitions: &[PartitionKey]) -> Vec<TaskHandle> {
        let Some(mut tasks) = self.tasks.get_mut(&consumer_id) else {
            return Vec::new();
        };
        partitions
            .iter()
            .filter_map(|partition| tasks.remove(partition))
            .collect()
    }

    pub fn take_all(&self, consumer_id: ConsumerId) -> Vec<TaskHandle> {
        self.tasks
            .remove(&consumer_id)
            .map(|(_, tasks)| tasks.into_values().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, consumer_id: ConsumerId) -> usize {
        self.tasks
            .get(&consumer_id)
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, consumer_id: ConsumerId) -> bool {
        self.len(consumer_id) == 0
    }
}

/// Schedules writing tasks on a fixed writer pool and tracks them per consumer.
///
/// All methods taking a consumer id are meant to be called from that consumer's thread only.
pub struct WriteCoordinator {
    pool: rayon::ThreadPool,
    writers: Arc<PartitionWriters>,
    active: ActiveTaskTable,
}

impl WriteCoordinator {
    pub fn new(
        settings: BatchWriterSettings,
        writer_threads: usize,
        sink: Arc<dyn UploadSink>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(writer_threads)
            .thread_name(|i| format!("archive-writer-{i}"))
            .panic_handler(|_| error!("Writing task panicked"))
            .build()
            .context("Failed to build writer thread pool")?;

        info!(
            writer_threads,
            compression = %settings.compression,
            capacity_bytes = settings.capacity_bytes,
            "Initialized write coordinator"
        );

        Ok(Self {
            pool,
            writers: Arc::new(PartitionWriters::new(settings, sink)),
            active: ActiveTaskTable::new(),
        })
    }

    /// Schedules a task for the records of one partition. Never blocks.
    pub fn submit(
        &self,
        consumer_id: ConsumerId,
        partition: PartitionKey,
        records: Vec<FetchedRecord>,
    ) -> Result<(), SubmitError> {
        if records.is_empty() {
            return Err(SubmitError::Empty(partition));
        }
        if self.active.get(consumer_id, &partition).is_some() {
            return Err(SubmitError::PartitionBusy {
                consumer_id,
                partition,
            });
        }

        let count = records.len();
        let (task, handle) =
            WritingTask::new(consumer_id, partition.clone(), records, self.writers.clone());
        self.active.register(consumer_id, handle)?;

        debug!(
            consumer_id,
            topic = partition.topic(),
            partition = partition.partition_number(),
            records = count,
            "Submitted writing task"
        );
        metrics::counter!(TASKS_SUBMITTED_COUNTER).increment(1);

        self.pool.spawn(move || task.run());
        Ok(())
    }

    /// Harvests the finished tasks of a consumer
    pub fn check_finished(&self, consumer_id: ConsumerId) -> Vec<FinishedWrite> {
        self.active
            .take_finished(consumer_id)
            .into_iter()
            .map(|handle| FinishedWrite {
                partition: handle.partition().clone(),
                result: handle.result().unwrap_or(crate::writer::task::ABNORMAL_TERMINATION),
                first_offset: handle.first_offset(),
                end_offset: handle.end_offset(),
            })
            .collect()
    }

    /// Stops the consumer's tasks for the revoked partitions and blocks until all of them are
    /// finished. Returns the offsets they reached.
    pub fn handle_revoked(
        &self,
        consumer_id: ConsumerId,
        partitions: &[PartitionKey],
    ) -> PendingOffsets {
        let revoked = self.active.remove(consumer_id, partitions);
        for handle in &revoked {
            handle.stop();
        }

        debug!(
            consumer_id,
            "Waiting for {} revoked writing tasks",
            revoked.len()
        );
        collect_offsets(revoked)
    }

    /// Waits, without stopping them, for every task of the consumer
    pub fn drain(&self, consumer_id: ConsumerId) -> PendingOffsets {
        let tasks = self.active.take_all(consumer_id);
        debug!(consumer_id, "Draining {} writing tasks", tasks.len());
        collect_offsets(tasks)
    }

    /// Flushes the partially filled batches of the given partitions
    pub fn flush_partitions(&self, partitions: &[PartitionKey]) {
        self.writers.flush_partitions(partitions);
    }

    /// Flushes every open batch. Consumers must be stopped first.
    pub fn shutdown(&self) {
        self.writers.flush_all();
    }

    pub fn task_handle(
        &self,
        consumer_id: ConsumerId,
        partition: &PartitionKey,
    ) -> Option<TaskHandle> {
        self.active.get(consumer_id, partition)
    }

    pub fn active_tasks(&self, consumer_id: ConsumerId) -> usize {
        self.active.len(consumer_id)
    }

    pub fn open_batches(&self) -> usize {
        self.writers.open_count()
    }
}

fn collect_offsets(tasks: Vec<TaskHandle>) -> PendingOffsets {
    let mut offsets = PendingOffsets::new();
    for handle in tasks {
        let result = handle.wait();
        if result > 0 {
            offsets.insert(handle.partition().clone(), OffsetAndMetadata::new(result));
        }
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionType;
    use crate::test_utils::RecordingSink;
    use crate::writer::task::TaskState;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn coordinator(
        dir: &TempDir,
        capacity: i64,
        threads: usize,
        sink: Arc<RecordingSink>,
    ) -> WriteCoordinator {
        WriteCoordinator::new(
            BatchWriterSettings {
                staging_dir: dir.path().to_path_buf(),
                capacity_bytes: capacity,
                flush_threshold_bytes: 10 * 1024 * 1024,
                compression: CompressionType::None,
            },
            threads,
            sink,
        )
        .unwrap()
    }

    fn records(partition: &PartitionKey, offsets: std::ops::Range<i64>) -> Vec<FetchedRecord> {
        offsets
            .map(|o| FetchedRecord::new(partition.clone(), o, None, vec![b'c'; 100]))
            .collect()
    }

    fn wait_for_finished(
        coordinator: &WriteCoordinator,
        consumer_id: ConsumerId,
    ) -> Vec<FinishedWrite> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let finished = coordinator.check_finished(consumer_id);
            if !finished.is_empty() || Instant::now() > deadline {
                return finished;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_submit_and_harvest() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let coordinator = coordinator(&dir, 1000, 2, sink.clone());
        let partition = PartitionKey::new("events", 0);

        coordinator
            .submit(0, partition.clone(), records(&partition, 0..20))
            .unwrap();
        let finished = wait_for_finished(&coordinator, 0);

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].partition, partition);
        assert_eq!(finished[0].offset(), Some(OffsetAndMetadata::new(20)));
        assert!(!finished[0].is_short());
        assert_eq!(coordinator.active_tasks(0), 0);
        assert_eq!(sink.submission_count(), 2);
    }

    #[test]
    fn test_second_submit_for_partition_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::blocking_at(1));
        let coordinator = coordinator(&dir, 1, 1, sink.clone());
        let partition = PartitionKey::new("events", 0);

        coordinator
            .submit(0, partition.clone(), records(&partition, 0..2))
            .unwrap();
        let err = coordinator
            .submit(0, partition.clone(), records(&partition, 2..4))
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::PartitionBusy {
                consumer_id: 0,
                partition: partition.clone()
            }
        );

        sink.release();
        let finished = wait_for_finished(&coordinator, 0);
        assert_eq!(finished[0].result, 2);
    }

    #[test]
    fn test_empty_submit_is_rejected() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, 1000, 1, Arc::new(RecordingSink::new()));
        let partition = PartitionKey::new("events", 0);

        assert_eq!(
            coordinator.submit(0, partition.clone(), Vec::new()),
            Err(SubmitError::Empty(partition))
        );
    }

    #[test]
    fn test_handle_revoked_waits_for_running_task() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::blocking_at(7));
        let coordinator = Arc::new(coordinator(&dir, 1, 2, sink.clone()));
        let partition = PartitionKey::new("events", 0);

        coordinator
            .submit(0, partition.clone(), records(&partition, 0..10))
            .unwrap();
        assert!(sink.wait_until_blocked(Duration::from_secs(10)));
        let handle = coordinator.task_handle(0, &partition).unwrap();

        let revoker = {
            let coordinator = coordinator.clone();
            let partition = partition.clone();
            std::thread::spawn(move || coordinator.handle_revoked(0, &[partition]))
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while !handle.is_stopped() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_stopped());
        assert!(!revoker.is_finished());
        assert_eq!(handle.state(), TaskState::Running);

        sink.release();
        let offsets = revoker.join().unwrap();
        assert_eq!(offsets.get(&partition), Some(&OffsetAndMetadata::new(7)));
        assert!(handle.is_finished());
        assert_eq!(coordinator.active_tasks(0), 0);
    }

    #[test]
    fn test_revoking_queued_task_does_not_wait_on_pool() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::blocking_at(1));
        let coordinator = coordinator(&dir, 1, 1, sink.clone());
        let busy = PartitionKey::new("events", 0);
        let queued = PartitionKey::new("events", 1);

        coordinator
            .submit(0, busy.clone(), records(&busy, 0..3))
            .unwrap();
        assert!(sink.wait_until_blocked(Duration::from_secs(10)));
        coordinator
            .submit(0, queued.clone(), records(&queued, 0..3))
            .unwrap();

        // the only writer thread is blocked, so the queued task never started
        let offsets = coordinator.handle_revoked(0, &[queued.clone()]);
        assert!(offsets.is_empty());

        sink.release();
        let offsets = coordinator.drain(0);
        assert_eq!(offsets.get(&busy), Some(&OffsetAndMetadata::new(3)));
        // the stopped task is a no-op once the pool reaches it
        assert_eq!(sink.submission_count(), 3);
    }

    #[test]
    fn test_revoke_of_other_consumer_partitions_is_ignored() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, 1000, 1, Arc::new(RecordingSink::new()));
        let partition = PartitionKey::new("events", 0);

        coordinator
            .submit(1, partition.clone(), records(&partition, 0..5))
            .unwrap();
        assert!(coordinator.handle_revoked(0, &[partition.clone()]).is_empty());

        let offsets = coordinator.drain(1);
        assert_eq!(offsets.get(&partition), Some(&OffsetAndMetadata::new(5)));
    }

    #[test]
    fn test_shutdown_flushes_open_batches() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let coordinator = coordinator(&dir, 1000, 1, sink.clone());
        let partition = PartitionKey::new("events", 2);

        coordinator
            .submit(0, partition.clone(), records(&partition, 0..4))
            .unwrap();
        coordinator.drain(0);
        assert_eq!(coordinator.open_batches(), 1);
        assert_eq!(sink.submission_count(), 0);

        coordinator.shutdown();
        assert_eq!(coordinator.open_batches(), 0);
        assert_eq!(sink.submission_count(), 1);
    }

    #[test]
    fn test_short_write_resume_offset() {
        let write = FinishedWrite {
            partition: PartitionKey::new("events", 0),
            result: -1,
            first_offset: 40,
            end_offset: 50,
        };
        assert!(write.is_short());
        assert_eq!(write.offset(), None);
        assert_eq!(write.resume_offset(), 40);

        let partial = FinishedWrite {
            result: 45,
            ..write
        };
        assert_eq!(partial.resume_offset(), 45);
        assert_eq!(partial.offset(), Some(OffsetAndMetadata::new(45)));
    }

    #[test]
    fn test_overlapping_tasks_of_two_consumers_lose_no_records() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let coordinator = coordinator(&dir, 100 * 1024 * 1024, 2, sink.clone());
        let partition = PartitionKey::new("events", 0);

        coordinator
            .submit(0, partition.clone(), records(&partition, 0..2000))
            .unwrap();
        coordinator
            .submit(1, partition.clone(), records(&partition, 0..2000))
            .unwrap();
        assert_eq!(
            coordinator.drain(0).get(&partition),
            Some(&OffsetAndMetadata::new(2000))
        );
        assert_eq!(
            coordinator.drain(1).get(&partition),
            Some(&OffsetAndMetadata::new(2000))
        );
        coordinator.shutdown();

        let lines: usize = sink
            .submissions()
            .iter()
            .map(|(path, _)| {
                let content = std::fs::read(path).unwrap();
                content.iter().filter(|b| **b == b'\n').count()
            })
            .sum();
        assert_eq!(lines, 4000);
    }
}
