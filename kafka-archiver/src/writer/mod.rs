pub mod batch_writer;
pub mod coordinator;
pub mod partition_writers;
pub mod task;

pub use batch_writer::{BatchWriterSettings, FlushedBatch, PartitionBatchWriter};
pub use coordinator::{ActiveTaskTable, FinishedWrite, SubmitError, WriteCoordinator};
pub use partition_writers::PartitionWriters;
pub use task::{TaskHandle, TaskState, WritingTask};
