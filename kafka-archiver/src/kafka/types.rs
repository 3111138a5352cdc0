use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use rdkafka::topic_partition_list::TopicPartitionListElem;

/// Index of a consumer worker within the consumer pool
pub type ConsumerId = usize;

/// Offsets waiting to be committed, keyed by partition
pub type PendingOffsets = HashMap<PartitionKey, OffsetAndMetadata>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    topic: String,
    partition_number: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for PartitionKey {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A record as it came off the broker. Never mutated after the fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    partition: PartitionKey,
    offset: i64,
    timestamp: Option<i64>,
    payload: Bytes,
}

impl FetchedRecord {
    pub fn new(
        partition: PartitionKey,
        offset: i64,
        timestamp: Option<i64>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            partition,
            offset,
            timestamp,
            payload: payload.into(),
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Broker timestamp in epoch millis, if the message carried one
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn serialized_size(&self) -> usize {
        self.payload.len()
    }
}

/// Offset to commit for a partition. The offset is always the next one to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    offset: i64,
    metadata: String,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: String::new(),
        }
    }

    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: metadata.into(),
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn metadata(&self) -> &str {
        &self.metadata
    }
}

/// Groups fetched records by partition, keeping fetch order inside each partition
pub fn group_by_partition(records: Vec<FetchedRecord>) -> Vec<(PartitionKey, Vec<FetchedRecord>)> {
    let mut grouped: Vec<(PartitionKey, Vec<FetchedRecord>)> = Vec::new();
    let mut index: HashMap<PartitionKey, usize> = HashMap::new();

    for record in records {
        match index.get(record.partition()) {
            Some(&i) => grouped[i].1.push(record),
            None => {
                index.insert(record.partition().clone(), grouped.len());
                grouped.push((record.partition().clone(), vec![record]));
            }
        }
    }

    grouped
}
