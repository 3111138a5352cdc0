use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::kafka::client::{BrokerClient, BrokerError, PartitionClient, RebalanceListener, Wakeup};
use crate::kafka::context::ArchiverConsumerContext;
use crate::kafka::types::{ConsumerId, FetchedRecord, PartitionKey, PendingOffsets};
use crate::metrics_const::POLL_ERRORS_COUNTER;

/// Longest a poll blocks inside librdkafka before checking for a wakeup
const WAKEUP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

fn partition_list(partitions: &[PartitionKey]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

fn offset_list(offsets: &PendingOffsets) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (partition, offset) in offsets {
        let mut elem = tpl.add_partition(partition.topic(), partition.partition_number());
        elem.set_offset(Offset::Offset(offset.offset()))?;
        elem.set_metadata(offset.metadata());
    }
    Ok(tpl)
}

impl PartitionClient for BaseConsumer<ArchiverConsumerContext> {
    fn pause(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        Consumer::pause(self, &partition_list(partitions))?;
        Ok(())
    }

    fn resume(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        Consumer::resume(self, &partition_list(partitions))?;
        Ok(())
    }

    fn seek(&self, partition: &PartitionKey, offset: i64) -> Result<(), BrokerError> {
        Consumer::seek(
            self,
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }

    fn commit(&self, offsets: &PendingOffsets) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        Consumer::commit(self, &offset_list(offsets)?, CommitMode::Sync)?;
        Ok(())
    }
}

/// Removes records of partitions revoked after they were fetched, returning how many were dropped
fn discard_revoked(records: &mut Vec<FetchedRecord>, revoked: &HashSet<PartitionKey>) -> usize {
    let before = records.len();
    records.retain(|record| !revoked.contains(record.partition()));
    before - records.len()
}

/// `BrokerClient` over an rdkafka `BaseConsumer`.
///
/// Rebalance callbacks run inside `poll` on the owning thread, through `ArchiverConsumerContext`.
pub struct KafkaBrokerClient {
    consumer_id: ConsumerId,
    consumer: BaseConsumer<ArchiverConsumerContext>,
    wakeup: Wakeup,
    max_poll_records: usize,
}

impl KafkaBrokerClient {
    pub fn new(
        consumer_id: ConsumerId,
        config: &ClientConfig,
        max_poll_records: usize,
    ) -> Result<Self, BrokerError> {
        let consumer: BaseConsumer<ArchiverConsumerContext> =
            config.create_with_context(ArchiverConsumerContext::new(consumer_id))?;

        Ok(Self {
            consumer_id,
            consumer,
            wakeup: Wakeup::new(),
            max_poll_records,
        })
    }
}

impl PartitionClient for KafkaBrokerClient {
    fn pause(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        PartitionClient::pause(&self.consumer, partitions)
    }

    fn resume(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        PartitionClient::resume(&self.consumer, partitions)
    }

    fn seek(&self, partition: &PartitionKey, offset: i64) -> Result<(), BrokerError> {
        PartitionClient::seek(&self.consumer, partition, offset)
    }

    fn commit(&self, offsets: &PendingOffsets) -> Result<(), BrokerError> {
        PartitionClient::commit(&self.consumer, offsets)
    }
}

impl BrokerClient for KafkaBrokerClient {
    fn subscribe(
        &self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError> {
        self.consumer.context().set_listener(listener);

        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        Consumer::subscribe(&self.consumer, &topics)?;

        info!(consumer_id = self.consumer_id, "Subscribed to topics: {:?}", topics);
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<FetchedRecord>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();
        // revocations served by an earlier poll have already been seen by the listener
        self.consumer.context().take_revoked();

        loop {
            if self.wakeup.take() {
                if records.is_empty() {
                    return Err(BrokerError::Wakeup);
                }
                // hand back what was fetched; the next poll reports the wakeup
                self.wakeup.wake();
                break;
            }

            // once something was fetched only what is already buffered is drained
            let slice = if records.is_empty() {
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(WAKEUP_CHECK_INTERVAL)
            } else {
                Duration::ZERO
            };

            let polled = self.consumer.poll(slice);

            // a revoke served inside this call invalidates what was fetched for those partitions
            let revoked = self.consumer.context().take_revoked();
            if !revoked.is_empty() {
                let dropped = discard_revoked(&mut records, &revoked);
                if dropped > 0 {
                    info!(
                        consumer_id = self.consumer_id,
                        "Discarded {dropped} fetched records of revoked partitions"
                    );
                }
            }

            match polled {
                None => {
                    if !records.is_empty() || Instant::now() >= deadline {
                        break;
                    }
                }
                Some(Ok(message)) => {
                    let payload = message.payload().map(|p| p.to_vec()).unwrap_or_default();
                    records.push(FetchedRecord::new(
                        PartitionKey::new(message.topic(), message.partition()),
                        message.offset(),
                        message.timestamp().to_millis(),
                        payload,
                    ));
                    if records.len() >= self.max_poll_records {
                        break;
                    }
                }
                Some(Err(e)) => {
                    metrics::counter!(POLL_ERRORS_COUNTER).increment(1);
                    if records.is_empty() {
                        return Err(e.into());
                    }
                    warn!(
                        consumer_id = self.consumer_id,
                        "Kafka error after fetching {} records: {e:#}",
                        records.len()
                    );
                    break;
                }
            }
        }

        Ok(records)
    }

    fn wakeup_handle(&self) -> Wakeup {
        self.wakeup.clone()
    }

    fn close(self) {
        Consumer::unsubscribe(&self.consumer);
        info!(consumer_id = self.consumer_id, "Kafka consumer closed");
    }
}

/// Fails with `ConfigError::MissingTopics` when any of `topics` is unknown to the broker
pub fn ensure_topics_exist(config: &ClientConfig, topics: &[String]) -> Result<()> {
    let consumer: BaseConsumer = config
        .create()
        .context("Failed to create Kafka client for topic validation")?;
    let metadata = consumer
        .fetch_metadata(None, METADATA_TIMEOUT)
        .context("Failed to fetch Kafka metadata")?;

    let known: HashSet<&str> = metadata.topics().iter().map(|t| t.name()).collect();
    let missing: Vec<String> = topics
        .iter()
        .filter(|t| !known.contains(t.as_str()))
        .cloned()
        .collect();

    if !missing.is_empty() {
        return Err(ConfigError::MissingTopics(missing).into());
    }

    info!("Validated topics {:?}", topics);
    Ok(())
}
