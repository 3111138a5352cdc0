use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};

use crate::kafka::client::{BrokerClient, PartitionClient, RebalanceListener, Wakeup};
use crate::kafka::types::{
    group_by_partition, ConsumerId, FetchedRecord, PartitionKey, PendingOffsets,
};
use crate::metrics_const::{
    ACTIVE_CONSUMERS_GAUGE, OFFSET_COMMITS_COUNTER, OFFSET_COMMIT_DURATION_HISTOGRAM,
    PARTITION_REWINDS_COUNTER, POLL_BATCH_SIZE_HISTOGRAM, POLL_ERRORS_COUNTER,
    RECORDS_DROPPED_COUNTER, RECORDS_POLLED_COUNTER,
};
use crate::utils::lock;
use crate::writer::coordinator::{SubmitError, WriteCoordinator};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub topics: Vec<String>,
    pub poll_timeout: Duration,
    pub commit_interval: Duration,
}

/// Merges offsets, keeping the highest offset per partition
fn merge_offsets(pending: &mut PendingOffsets, offsets: PendingOffsets) {
    for (partition, offset) in offsets {
        match pending.get(&partition) {
            Some(existing) if existing.offset() >= offset.offset() => {}
            _ => {
                pending.insert(partition, offset);
            }
        }
    }
}

fn commit_offsets(
    consumer_id: ConsumerId,
    client: &dyn PartitionClient,
    offsets: &PendingOffsets,
    trigger: &'static str,
) -> bool {
    let start = Instant::now();
    let result = client.commit(offsets);
    metrics::histogram!(OFFSET_COMMIT_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            debug!(
                consumer_id,
                trigger,
                "Committed offsets for {} partitions",
                offsets.len()
            );
            metrics::counter!(OFFSET_COMMITS_COUNTER, "status" => "success", "trigger" => trigger)
                .increment(1);
            true
        }
        Err(e) => {
            error!(
                consumer_id,
                trigger,
                "Failed to commit offsets for {} partitions: {e:#}",
                offsets.len()
            );
            metrics::counter!(OFFSET_COMMITS_COUNTER, "status" => "failure", "trigger" => trigger)
                .increment(1);
            false
        }
    }
}

/// State shared between the poll loop and the rebalance callbacks.
///
/// Both run on the worker thread (callbacks are made from inside `poll`), the locks only make
/// the sharing expressible.
struct WorkerState {
    consumer_id: ConsumerId,
    coordinator: Arc<WriteCoordinator>,
    pending: Mutex<PendingOffsets>,
    assigned: Mutex<BTreeSet<PartitionKey>>,
}

impl RebalanceListener for WorkerState {
    fn on_partitions_revoked(&self, partitions: &[PartitionKey], client: &dyn PartitionClient) {
        info!(
            consumer_id = self.consumer_id,
            "Partitions revoked: {:?}",
            partitions.iter().map(|p| p.to_string()).collect::<Vec<_>>()
        );

        let reached = self.coordinator.handle_revoked(self.consumer_id, partitions);

        let to_commit: PendingOffsets = {
            let mut pending = lock(&self.pending);
            merge_offsets(&mut pending, reached);
            partitions
                .iter()
                .filter_map(|p| pending.remove(p).map(|offset| (p.clone(), offset)))
                .collect()
        };

        {
            let mut assigned = lock(&self.assigned);
            for partition in partitions {
                assigned.remove(partition);
            }
        }

        if to_commit.is_empty() {
            return;
        }
        if !commit_offsets(self.consumer_id, client, &to_commit, "revoke") {
            warn!(
                consumer_id = self.consumer_id,
                "Offsets of revoked partitions not committed, the next owner re-processes them"
            );
        }
    }

    fn on_partitions_assigned(&self, partitions: &[PartitionKey], client: &dyn PartitionClient) {
        info!(
            consumer_id = self.consumer_id,
            "Partitions assigned: {:?}",
            partitions.iter().map(|p| p.to_string()).collect::<Vec<_>>()
        );

        lock(&self.assigned).extend(partitions.iter().cloned());

        if let Err(e) = client.resume(partitions) {
            error!(
                consumer_id = self.consumer_id,
                "Failed to resume assigned partitions: {e:#}"
            );
        }
    }
}

/// Stops a running worker from another thread
#[derive(Clone)]
pub struct WorkerHandle {
    consumer_id: ConsumerId,
    stopped: Arc<AtomicBool>,
    wakeup: Wakeup,
}

impl WorkerHandle {
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// Requests a stop and interrupts a blocking poll
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wakeup.wake();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Polls one broker client and feeds the write coordinator.
///
/// Each iteration submits every polled partition's records as a writing task and pauses the
/// partition, so at most one task writes a partition at a time. Records of partitions the
/// consumer does not hold when they are dispatched are dropped. Finished tasks are harvested
/// on the same iteration; their partitions are resumed and their offsets become pending.
/// Pending offsets are committed on an interval and, for revoked partitions, before the
/// revocation completes.
pub struct ConsumerWorker<C: BrokerClient> {
    state: Arc<WorkerState>,
    client: C,
    settings: WorkerSettings,
    stopped: Arc<AtomicBool>,
}

impl<C: BrokerClient> ConsumerWorker<C> {
    pub fn new(
        consumer_id: ConsumerId,
        client: C,
        coordinator: Arc<WriteCoordinator>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            state: Arc::new(WorkerState {
                consumer_id,
                coordinator,
                pending: Mutex::new(PendingOffsets::new()),
                assigned: Mutex::new(BTreeSet::new()),
            }),
            client,
            settings,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            consumer_id: self.state.consumer_id,
            stopped: self.stopped.clone(),
            wakeup: self.client.wakeup_handle(),
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Runs until stopped. The client is drained, committed and closed on every exit path once
    /// the subscription succeeded.
    pub fn run(self) -> Result<()> {
        let consumer_id = self.state.consumer_id;
        let listener: Arc<dyn RebalanceListener> = self.state.clone();
        self.client
            .subscribe(&self.settings.topics, listener)
            .with_context(|| format!("Consumer {consumer_id} failed to subscribe"))?;

        info!(consumer_id, "Consumer worker started");
        metrics::gauge!(ACTIVE_CONSUMERS_GAUGE).increment(1.0);

        let result = self.poll_loop();
        if let Err(e) = &result {
            error!(consumer_id, "Consumer worker failed: {e:#}");
        }

        self.close();
        metrics::gauge!(ACTIVE_CONSUMERS_GAUGE).decrement(1.0);
        info!(consumer_id, "Consumer worker closed");
        result
    }

    fn poll_loop(&self) -> Result<()> {
        let consumer_id = self.state.consumer_id;
        let mut last_commit = Instant::now();

        while !self.is_stopping() {
            match self.client.poll(self.settings.poll_timeout) {
                Ok(records) => self.dispatch(records),
                Err(e) if e.is_wakeup() => {
                    if self.is_stopping() {
                        break;
                    }
                    return Err(anyhow!(e).context(format!(
                        "Consumer {consumer_id} poll woken up without a stop request"
                    )));
                }
                Err(e) => {
                    metrics::counter!(POLL_ERRORS_COUNTER).increment(1);
                    warn!(consumer_id, "Poll failed: {e:#}");
                }
            }

            self.harvest();

            if last_commit.elapsed() >= self.settings.commit_interval {
                // a failed commit is retried at the next interval, not on the next iteration
                last_commit = Instant::now();
                self.commit_pending("interval");
            }
        }

        info!(consumer_id, "Stop requested, leaving poll loop");
        Ok(())
    }

    fn dispatch(&self, records: Vec<FetchedRecord>) {
        if records.is_empty() {
            return;
        }
        let consumer_id = self.state.consumer_id;
        metrics::counter!(RECORDS_POLLED_COUNTER).increment(records.len() as u64);
        metrics::histogram!(POLL_BATCH_SIZE_HISTOGRAM).record(records.len() as f64);

        // a rebalance inside poll can revoke partitions after their records were fetched
        let assigned = lock(&self.state.assigned).clone();
        let mut submitted = Vec::new();
        for (partition, records) in group_by_partition(records) {
            if !assigned.contains(&partition) {
                warn!(
                    consumer_id,
                    partition = %partition,
                    records = records.len(),
                    "Dropping records of a partition not assigned to this consumer"
                );
                metrics::counter!(RECORDS_DROPPED_COUNTER).increment(records.len() as u64);
                continue;
            }
            let first_offset = records.first().map(|r| r.offset());
            match self
                .state
                .coordinator
                .submit(consumer_id, partition.clone(), records)
            {
                Ok(()) => submitted.push(partition),
                Err(e @ SubmitError::PartitionBusy { .. }) => {
                    error!(consumer_id, "Records fetched for a busy partition: {e}");
                    // fetch them again once the running task is harvested
                    if let Some(offset) = first_offset {
                        self.rewind(&partition, offset);
                    }
                }
                Err(e) => warn!(consumer_id, "Skipping submission: {e}"),
            }
        }

        if let Err(e) = self.client.pause(&submitted) {
            error!(consumer_id, "Failed to pause {} partitions: {e:#}", submitted.len());
        }
    }

    fn harvest(&self) {
        let consumer_id = self.state.consumer_id;
        let finished = self.state.coordinator.check_finished(consumer_id);
        if finished.is_empty() {
            return;
        }

        let mut resumed = Vec::with_capacity(finished.len());
        let mut reached = PendingOffsets::new();
        for write in finished {
            if write.is_short() {
                warn!(
                    consumer_id,
                    partition = %write.partition,
                    result = write.result,
                    end_offset = write.end_offset,
                    "Writing task stopped short, re-fetching from {}",
                    write.resume_offset()
                );
                metrics::counter!(PARTITION_REWINDS_COUNTER).increment(1);
                self.rewind(&write.partition, write.resume_offset());
            }
            if let Some(offset) = write.offset() {
                reached.insert(write.partition.clone(), offset);
            }
            resumed.push(write.partition);
        }

        merge_offsets(&mut lock(&self.state.pending), reached);

        if let Err(e) = self.client.resume(&resumed) {
            error!(consumer_id, "Failed to resume {} partitions: {e:#}", resumed.len());
        }
    }

    fn rewind(&self, partition: &PartitionKey, offset: i64) {
        if let Err(e) = self.client.seek(partition, offset) {
            error!(
                consumer_id = self.state.consumer_id,
                partition = %partition,
                offset,
                "Failed to seek: {e:#}"
            );
        }
    }

    /// Commits every pending offset; entries are kept for a retry when the commit fails
    fn commit_pending(&self, trigger: &'static str) {
        let offsets = lock(&self.state.pending).clone();
        if offsets.is_empty() {
            return;
        }
        if commit_offsets(self.state.consumer_id, &self.client, &offsets, trigger) {
            let mut pending = lock(&self.state.pending);
            for (partition, offset) in &offsets {
                if pending.get(partition) == Some(offset) {
                    pending.remove(partition);
                }
            }
        }
    }

    fn close(self) {
        let consumer_id = self.state.consumer_id;

        let reached = self.state.coordinator.drain(consumer_id);
        merge_offsets(&mut lock(&self.state.pending), reached);
        self.commit_pending("shutdown");

        let assigned: Vec<PartitionKey> = lock(&self.state.assigned).iter().cloned().collect();
        self.state.coordinator.flush_partitions(&assigned);

        self.client.close();
    }

    #[cfg(test)]
    fn pending_offsets(&self) -> PendingOffsets {
        lock(&self.state.pending).clone()
    }
}
