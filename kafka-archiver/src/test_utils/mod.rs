//! Shared test utilities for the kafka-archiver crate.
//!
//! Used in "mod tests" and by the tests/ directory: an in-memory broker with consumer-group
//! rebalances and an upload sink that records what it is given.

pub mod mock_broker;
pub mod recording_sink;

pub use mock_broker::{CommitEntry, MemberId, MockBroker, MockBrokerClient};
pub use recording_sink::RecordingSink;

pub(crate) use crate::utils::lock;
