// ==== Consumer metrics ====
/// Counter for records returned by broker polls
pub const RECORDS_POLLED_COUNTER: &str = "archiver_records_polled_total";

/// Histogram for the number of records returned by one poll
pub const POLL_BATCH_SIZE_HISTOGRAM: &str = "archiver_poll_batch_size";

/// Counter for polled records dropped because their partition is no longer assigned
pub const RECORDS_DROPPED_COUNTER: &str = "archiver_records_dropped_total";

/// Counter for poll errors other than a deliberate wakeup
pub const POLL_ERRORS_COUNTER: &str = "archiver_poll_errors_total";

/// Counter for rebalance events (with event_type label: assign/revoke)
pub const REBALANCE_EVENTS: &str = "archiver_rebalance_events_total";

/// Counter for partitions rewound after a short write
pub const PARTITION_REWINDS_COUNTER: &str = "archiver_partition_rewinds_total";

/// Gauge for consumer workers currently running
pub const ACTIVE_CONSUMERS_GAUGE: &str = "archiver_active_consumers";

// ==== Offset commit metrics ====
/// Counter for offset commits (with status label: success/failure, and trigger label:
/// interval/revoke/shutdown)
pub const OFFSET_COMMITS_COUNTER: &str = "archiver_offset_commits_total";

/// Counter for librdkafka commit callbacks (with status label)
pub const OFFSET_COMMIT_CALLBACKS: &str = "archiver_offset_commit_callbacks_total";

/// Histogram for synchronous commit duration
pub const OFFSET_COMMIT_DURATION_HISTOGRAM: &str = "archiver_offset_commit_duration_seconds";

// ==== Writer metrics ====
/// Counter for writing tasks submitted to the writer pool
pub const TASKS_SUBMITTED_COUNTER: &str = "archiver_writing_tasks_submitted_total";

/// Counter for writing tasks finished (with outcome label: completed/stopped/failed/abnormal)
pub const TASKS_FINISHED_COUNTER: &str = "archiver_writing_tasks_finished_total";

/// Histogram for writing task run time
pub const TASK_DURATION_HISTOGRAM: &str = "archiver_writing_task_duration_seconds";

/// Counter for records appended to batch files
pub const RECORDS_WRITTEN_COUNTER: &str = "archiver_records_written_total";

/// Counter for payload bytes appended to batch files
pub const BYTES_WRITTEN_COUNTER: &str = "archiver_bytes_written_total";

/// Counter for batch write failures (with stage label: create/append/flush/abandoned)
pub const WRITE_ERRORS_COUNTER: &str = "archiver_write_errors_total";

/// Counter for batches flushed and handed to the upload sink
pub const BATCHES_FLUSHED_COUNTER: &str = "archiver_batches_flushed_total";

/// Histogram for on-disk size of flushed batches
pub const BATCH_FILE_SIZE_HISTOGRAM: &str = "archiver_batch_file_size_bytes";

/// Gauge for batch writers holding a partially filled file
pub const OPEN_BATCH_WRITERS_GAUGE: &str = "archiver_open_batch_writers";

// ==== Upload metrics ====
/// Counter for uploads (with status label: success/failure)
pub const UPLOADS_COUNTER: &str = "archiver_uploads_total";

/// Histogram for upload duration
pub const UPLOAD_DURATION_HISTOGRAM: &str = "archiver_upload_duration_seconds";

/// Gauge for uploads in flight
pub const UPLOADS_IN_FLIGHT_GAUGE: &str = "archiver_uploads_in_flight";
