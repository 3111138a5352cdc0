// Consumer module - per-thread poll loops and their supervision
pub mod pool;
pub mod worker;

pub use pool::ConsumerPool;
pub use worker::{ConsumerWorker, WorkerHandle, WorkerSettings};
