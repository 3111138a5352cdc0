use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::client::RebalanceListener;
use crate::kafka::types::{ConsumerId, PartitionKey};
use crate::metrics_const::{OFFSET_COMMIT_CALLBACKS, REBALANCE_EVENTS};
use crate::utils::lock;

/// rdkafka context that forwards group rebalances to the consumer worker's listener.
///
/// librdkafka runs these callbacks on the thread calling `poll`, which is always the worker
/// thread owning the consumer, so the listener can block on in-flight writes and commit
/// synchronously before the revocation is acknowledged to the group.
pub struct ArchiverConsumerContext {
    consumer_id: ConsumerId,
    listener: OnceLock<Arc<dyn RebalanceListener>>,
    /// Partitions revoked since `take_revoked` was last called
    revoked: Mutex<HashSet<PartitionKey>>,
}

impl ArchiverConsumerContext {
    pub fn new(consumer_id: ConsumerId) -> Self {
        Self {
            consumer_id,
            listener: OnceLock::new(),
            revoked: Mutex::new(HashSet::new()),
        }
    }

    /// Drains the set of partitions revoked by rebalances served since the previous call
    pub fn take_revoked(&self) -> HashSet<PartitionKey> {
        std::mem::take(&mut *lock(&self.revoked))
    }

    /// Installs the rebalance listener. Only the first call has an effect.
    pub fn set_listener(&self, listener: Arc<dyn RebalanceListener>) {
        if self.listener.set(listener).is_err() {
            warn!(
                consumer_id = self.consumer_id,
                "Rebalance listener already installed, ignoring"
            );
        }
    }

    fn partition_keys(partitions: &TopicPartitionList) -> Vec<PartitionKey> {
        partitions
            .elements()
            .into_iter()
            .map(PartitionKey::from)
            .collect()
    }
}

impl ClientContext for ArchiverConsumerContext {}

impl ConsumerContext for ArchiverConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!(consumer_id = self.consumer_id, "Skipping empty revoke");
                    return;
                }

                info!(
                    consumer_id = self.consumer_id,
                    "Revoking {} partitions",
                    partitions.count()
                );
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);

                let keys = Self::partition_keys(partitions);
                lock(&self.revoked).extend(keys.iter().cloned());
                match self.listener.get() {
                    Some(listener) => listener.on_partitions_revoked(&keys, base_consumer),
                    None => warn!(
                        consumer_id = self.consumer_id,
                        "Partitions revoked before a listener was installed"
                    ),
                }
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    consumer_id = self.consumer_id,
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!(consumer_id = self.consumer_id, "Rebalance error: {e:#}");
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!(consumer_id = self.consumer_id, "Skipping empty assign");
                    return;
                }

                info!(
                    consumer_id = self.consumer_id,
                    "Assigned {} partitions",
                    partitions.count()
                );
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);

                let keys = Self::partition_keys(partitions);
                match self.listener.get() {
                    Some(listener) => listener.on_partitions_assigned(&keys, base_consumer),
                    None => warn!(
                        consumer_id = self.consumer_id,
                        "Partitions assigned before a listener was installed"
                    ),
                }
            }
            Rebalance::Revoke(_) => {
                debug!(consumer_id = self.consumer_id, "Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!(consumer_id = self.consumer_id, "Post-rebalance error: {e:#}");
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!(
                    consumer_id = self.consumer_id,
                    "Committed offsets for {} partitions",
                    offsets.count()
                );
                metrics::counter!(OFFSET_COMMIT_CALLBACKS, "status" => "success").increment(1);
            }
            Err(e) => {
                warn!(
                    consumer_id = self.consumer_id,
                    "Offset commit callback reported failure: {e:#}"
                );
                metrics::counter!(OFFSET_COMMIT_CALLBACKS, "status" => "failure").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    #[test]
    fn test_partition_keys_from_list() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset("events", 0, Offset::Beginning)
            .unwrap();
        tpl.add_partition_offset("events", 2, Offset::Beginning)
            .unwrap();

        let keys = ArchiverConsumerContext::partition_keys(&tpl);
        assert_eq!(
            keys,
            vec![PartitionKey::new("events", 0), PartitionKey::new("events", 2)]
        );
    }

    #[test]
    fn test_empty_list_has_no_keys() {
        let tpl = TopicPartitionList::new();
        assert!(ArchiverConsumerContext::partition_keys(&tpl).is_empty());
    }

    #[test]
    fn test_revoked_partitions_are_taken_once() {
        let context = ArchiverConsumerContext::new(0);
        assert!(context.take_revoked().is_empty());

        lock(&context.revoked).extend([PartitionKey::new("events", 1)]);
        let revoked = context.take_revoked();
        assert!(revoked.contains(&PartitionKey::new("events", 1)));
        assert!(context.take_revoked().is_empty());
    }
}
