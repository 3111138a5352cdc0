use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::kafka::types::{FetchedRecord, PartitionKey, PendingOffsets};

#[derive(Error, Debug)]
pub enum BrokerError {
    /// A pending poll was interrupted through the client's wakeup handle
    #[error("poll interrupted by wakeup")]
    Wakeup,

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("broker client error: {0}")]
    Client(String),
}

impl BrokerError {
    pub fn is_wakeup(&self) -> bool {
        matches!(self, BrokerError::Wakeup)
    }
}

/// Cloneable handle used from another thread to interrupt a blocking poll.
/// The next (or current) poll observes the flag once and fails with `BrokerError::Wakeup`.
#[derive(Debug, Clone, Default)]
pub struct Wakeup {
    flag: Arc<AtomicBool>,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending wakeup, returning whether one was set
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

/// Per-partition flow control and offset commits.
///
/// This is the part of a broker client that a rebalance listener is allowed to touch while the
/// client is inside `poll`.
pub trait PartitionClient {
    fn pause(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError>;

    fn resume(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError>;

    /// Moves the fetch position of a partition, used to re-fetch records that were never written
    fn seek(&self, partition: &PartitionKey, offset: i64) -> Result<(), BrokerError>;

    /// Synchronous commit; returns only once the broker acknowledged or rejected the offsets
    fn commit(&self, offsets: &PendingOffsets) -> Result<(), BrokerError>;
}

/// A group-managed broker connection owned by exactly one consumer thread.
pub trait BrokerClient: PartitionClient + Send {
    /// Joins the consumer group. The listener is invoked from inside `poll`, on the polling thread.
    fn subscribe(
        &self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for records. An empty result is not an error.
    fn poll(&self, timeout: Duration) -> Result<Vec<FetchedRecord>, BrokerError>;

    fn wakeup_handle(&self) -> Wakeup;

    fn close(self);
}

/// Callbacks for group rebalances, invoked synchronously by the broker client during `poll`.
///
/// The broker holds the rebalance open until these return, so work here must be limited to
/// what the offset protocol needs: draining in-flight writes and committing their offsets.
pub trait RebalanceListener: Send + Sync {
    /// Called before the partitions are handed to another group member
    fn on_partitions_revoked(&self, partitions: &[PartitionKey], client: &dyn PartitionClient);

    /// Called once the partitions are owned by this member
    fn on_partitions_assigned(&self, partitions: &[PartitionKey], client: &dyn PartitionClient);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeup_is_consumed_once() {
        let wakeup = Wakeup::new();
        let remote = wakeup.clone();

        assert!(!wakeup.take());
        remote.wake();
        assert!(wakeup.take());
        assert!(!wakeup.take());
    }

    #[test]
    fn test_broker_error_is_wakeup() {
        assert!(BrokerError::Wakeup.is_wakeup());
        assert!(!BrokerError::Client("boom".to_string()).is_wakeup());
    }
}
