use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::kafka::types::{ConsumerId, FetchedRecord, PartitionKey};
use crate::metrics_const::{
    BYTES_WRITTEN_COUNTER, RECORDS_WRITTEN_COUNTER, TASKS_FINISHED_COUNTER,
    TASK_DURATION_HISTOGRAM, WRITE_ERRORS_COUNTER,
};
use crate::writer::batch_writer::PartitionBatchWriter;
use crate::writer::partition_writers::PartitionWriters;

/// Completion value of a task that terminated abnormally
pub const ABNORMAL_TERMINATION: i64 = -1;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Finished,
}

struct TaskShared {
    consumer_id: ConsumerId,
    partition: PartitionKey,
    state: AtomicU8,
    stopped: AtomicBool,
    watermark: AtomicI64,
    completion: watch::Sender<Option<i64>>,
}

impl TaskShared {
    /// Fires the completion signal. Only the first call has an effect.
    fn complete(&self, value: i64) -> bool {
        let fired = self.completion.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(value);
                true
            } else {
                false
            }
        });
        if fired {
            self.state.store(FINISHED, Ordering::SeqCst);
        }
        fired
    }
}

/// Writes one fetched batch of a partition into its batch writer.
///
/// Created by the coordinator and executed once on the writer pool. The stop flag is checked
/// before every record, and the watermark (next offset to read) only moves past a record once
/// it is appended to a batch file, or flushed when the append filled the batch.
pub struct WritingTask {
    shared: Arc<TaskShared>,
    records: Vec<FetchedRecord>,
    writers: Arc<PartitionWriters>,
}

/// Observer side of a `WritingTask`, held by the coordinator
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    completion: watch::Receiver<Option<i64>>,
    first_offset: i64,
    end_offset: i64,
}

impl WritingTask {
    pub fn new(
        consumer_id: ConsumerId,
        partition: PartitionKey,
        records: Vec<FetchedRecord>,
        writers: Arc<PartitionWriters>,
    ) -> (Self, TaskHandle) {
        let (tx, rx) = watch::channel(None);
        let first_offset = records.first().map(|r| r.offset()).unwrap_or(0);
        let end_offset = records.last().map(|r| r.offset() + 1).unwrap_or(0);

        let shared = Arc::new(TaskShared {
            consumer_id,
            partition,
            state: AtomicU8::new(QUEUED),
            stopped: AtomicBool::new(false),
            watermark: AtomicI64::new(0),
            completion: tx,
        });

        let handle = TaskHandle {
            shared: shared.clone(),
            completion: rx,
            first_offset,
            end_offset,
        };

        (
            Self {
                shared,
                records,
                writers,
            },
            handle,
        )
    }

    /// Runs the task to completion on the calling thread. A task stopped before it started
    /// only completes with watermark 0.
    pub fn run(self) {
        if self
            .shared
            .state
            .compare_exchange(QUEUED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                consumer_id = self.shared.consumer_id,
                partition = %self.shared.partition,
                "Task stopped before it started"
            );
            // stop() may not have fired completion yet, and Drop must not win with -1
            self.shared.complete(0);
            return;
        }

        let start = Instant::now();
        let mut writer = self.writers.checkout(&self.shared.partition);
        let result = self.write_records(&mut writer);

        // the writer goes back before completion so the next task for the partition finds it
        if let Some(writer) = writer {
            self.writers.checkin(writer);
        }

        metrics::histogram!(TASK_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());

        let watermark = self.shared.watermark.load(Ordering::SeqCst);
        let outcome = match &result {
            Err(e) => {
                error!(
                    consumer_id = self.shared.consumer_id,
                    topic = self.shared.partition.topic(),
                    partition = self.shared.partition.partition_number(),
                    watermark,
                    "Writing task aborted: {e:#}"
                );
                "failed"
            }
            Ok(()) if self.shared.stopped.load(Ordering::SeqCst) => "stopped",
            Ok(()) => "completed",
        };
        metrics::counter!(TASKS_FINISHED_COUNTER, "outcome" => outcome).increment(1);

        self.shared.complete(watermark);
    }

    fn write_records(&self, writer: &mut Option<PartitionBatchWriter>) -> Result<()> {
        for record in &self.records {
            if self.shared.stopped.load(Ordering::SeqCst) {
                debug!(
                    consumer_id = self.shared.consumer_id,
                    partition = %self.shared.partition,
                    offset = record.offset(),
                    "Task stopped"
                );
                break;
            }

            let current = match writer.take() {
                Some(w) => w,
                None => self.writers.open(&self.shared.partition).inspect_err(|_| {
                    metrics::counter!(WRITE_ERRORS_COUNTER, "stage" => "create").increment(1);
                })?,
            };
            let current = writer.insert(current);

            if let Err(e) = current.add_record(record) {
                metrics::counter!(WRITE_ERRORS_COUNTER, "stage" => "append").increment(1);
                // the batch may end in a partial record and cannot be continued
                if let Some(broken) = writer.take() {
                    self.salvage(broken);
                }
                return Err(anyhow::Error::new(e).context(format!(
                    "Failed to append offset {} to batch for {}",
                    record.offset(),
                    self.shared.partition
                )));
            }
            metrics::counter!(RECORDS_WRITTEN_COUNTER).increment(1);
            metrics::counter!(BYTES_WRITTEN_COUNTER).increment(record.serialized_size() as u64);

            if current.ready_for_commit() {
                if let Some(full) = writer.take() {
                    self.writers.flush_and_submit(full).inspect_err(|_| {
                        metrics::counter!(WRITE_ERRORS_COUNTER, "stage" => "flush").increment(1);
                    })?;
                }
            }

            self.shared
                .watermark
                .store(record.offset() + 1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Uploads the records that made it into a batch before an append failed. The failed
    /// record is fetched again into a new batch since the watermark never moved past it.
    fn salvage(&self, writer: PartitionBatchWriter) {
        let records = writer.record_count();
        let key = writer.destination_key().to_string();
        warn!(
            topic = self.shared.partition.topic(),
            partition = self.shared.partition.partition_number(),
            records,
            "Closing batch {key} early after a failed append"
        );

        if let Err(e) = self.writers.flush_and_submit(writer) {
            metrics::counter!(WRITE_ERRORS_COUNTER, "stage" => "abandoned").increment(1);
            error!(
                topic = self.shared.partition.topic(),
                partition = self.shared.partition.partition_number(),
                records,
                "Batch {key} left in the staging directory: {e:#}"
            );
        }
    }
}

impl Drop for WritingTask {
    fn drop(&mut self) {
        if self.shared.complete(ABNORMAL_TERMINATION) {
            warn!(
                consumer_id = self.shared.consumer_id,
                partition = %self.shared.partition,
                "Writing task terminated without completing"
            );
            metrics::counter!(TASKS_FINISHED_COUNTER, "outcome" => "abnormal").increment(1);
        }
    }
}

impl TaskHandle {
    pub fn consumer_id(&self) -> ConsumerId {
        self.shared.consumer_id
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.shared.partition
    }

    /// Offset of the first record handed to the task
    pub fn first_offset(&self) -> i64 {
        self.first_offset
    }

    /// Offset after the last record handed to the task
    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    pub fn state(&self) -> TaskState {
        match self.shared.state.load(Ordering::SeqCst) {
            QUEUED => TaskState::Queued,
            RUNNING => TaskState::Running,
            _ => TaskState::Finished,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completion.borrow().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Current watermark. Never decreases.
    pub fn watermark(&self) -> i64 {
        self.shared.watermark.load(Ordering::SeqCst)
    }

    /// Final result once finished: the frozen watermark, or -1 after abnormal termination
    pub fn result(&self) -> Option<i64> {
        *self.completion.borrow()
    }

    /// Asks the task to stop before its next record. A task that has not started yet is
    /// finished immediately with watermark 0.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if self
            .shared
            .state
            .compare_exchange(QUEUED, FINISHED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shared.complete(0);
            metrics::counter!(TASKS_FINISHED_COUNTER, "outcome" => "stopped").increment(1);
        }
    }

    /// Blocks the calling thread until the task is finished and returns its result
    pub fn wait(&self) -> i64 {
        let mut completion = self.completion.clone();
        let outcome = futures::executor::block_on(completion.wait_for(|value| value.is_some()))
            .map(|value| *value);
        outcome.ok().flatten().unwrap_or(ABNORMAL_TERMINATION)
    }
}
