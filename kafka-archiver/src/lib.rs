//! Kafka archiver service.
//!
//! Consumes topics with a pool of consumer threads, appends records to compressed per-partition
//! batch files on a separate writer pool, and hands full batches to an upload sink. Offsets are
//! committed only once the records they cover are in a batch writer.
//!
//! ## Error logging (anyhow)
//!
//! Log errors with formats that keep the cause chain:
//!
//! - **Inline format:** `{e:#}` prints the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` prints the chain with `Caused by:` sections.
//!
//! Avoid `{}` / `%e` for errors, which only show the top-level message.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod compression;
pub mod config;
pub mod consumer;
pub mod kafka;
pub mod metrics_const;
pub mod metrics_server;
pub mod service;
pub mod test_utils;
pub mod upload;
pub mod utils;
pub mod writer;

pub use compression::CompressionType;
pub use config::{Config, ConfigError};
pub use service::ArchiverService;
