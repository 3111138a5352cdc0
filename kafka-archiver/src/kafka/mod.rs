// Kafka module - broker client abstraction, rdkafka implementation and rebalance forwarding
pub mod client;
pub mod config;
pub mod context;
pub mod rdkafka_client;
pub mod types;

// Public API
pub use client::{BrokerClient, BrokerError, PartitionClient, RebalanceListener, Wakeup};
pub use config::ConsumerConfigBuilder;
pub use rdkafka_client::{ensure_topics_exist, KafkaBrokerClient};
pub use types::{
    group_by_partition, ConsumerId, FetchedRecord, OffsetAndMetadata, PartitionKey,
    PendingOffsets,
};
