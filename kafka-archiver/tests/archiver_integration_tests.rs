//! End-to-end tests of the archiver service against the in-memory broker.
//!
//! The consumer pool, writer pool and sinks are the production ones; only the broker client is
//! swapped for `MockBrokerClient`.

mod common;

use std::path::Path;
use std::sync::Arc;

use kafka_archiver::compression::CompressionType;
use kafka_archiver::service::ArchiverService;
use kafka_archiver::test_utils::{MockBroker, MockBrokerClient, RecordingSink};
use kafka_archiver::upload::LocalDirectorySink;
use tempfile::TempDir;

use common::{
    files_under, partition, payload, produce, read_batch, test_config, wait_for_commits, TOPIC,
};

const MAX_RECORDS_PER_POLL: usize = 10;

fn start_service(service: &mut ArchiverService, broker: &Arc<MockBroker>) {
    service
        .start_with(|_| Ok(MockBrokerClient::new(broker.clone(), MAX_RECORDS_PER_POLL)))
        .unwrap();
}

/// Concatenated records of a partition's batches, in flush order
fn archived_records(sink: &RecordingSink, number: i32) -> Vec<String> {
    sink.files_for(TOPIC, number)
        .iter()
        .flat_map(|path| read_batch(path, CompressionType::None))
        .collect()
}

fn expected_records(count: usize) -> Vec<String> {
    (0..count).map(payload).collect()
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

#[test]
fn test_two_consumers_archive_four_partitions() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    broker.create_topic(TOPIC, 4);
    for p in 0..4 {
        produce(&broker, p, 0..50);
    }

    let sink = Arc::new(RecordingSink::new());
    let mut service = ArchiverService::new(test_config(&dir, &[]), sink.clone()).unwrap();
    start_service(&mut service, &broker);

    wait_for_commits(&broker, 4, 50);
    service.shutdown().unwrap();

    for p in 0..4 {
        assert_eq!(sink.keys_for(TOPIC, p).len(), 5, "batches for partition {p}");
        assert_eq!(archived_records(&sink, p), expected_records(50));
        assert_eq!(broker.committed_offset(&partition(p)), Some(50));
    }
    assert_eq!(sink.submission_count(), 20);
    assert_eq!(broker.member_count(), 0);
}

#[test]
fn test_rebalance_mid_stream_keeps_batches_exact() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    broker.create_topic(TOPIC, 4);
    for p in 0..4 {
        produce(&broker, p, 0..25);
    }

    let sink = Arc::new(RecordingSink::new());
    let mut service = ArchiverService::new(test_config(&dir, &[]), sink.clone()).unwrap();
    start_service(&mut service, &broker);
    wait_for_commits(&broker, 4, 25);

    let generation = broker.generation();
    broker.trigger_rebalance();
    for p in 0..4 {
        produce(&broker, p, 25..50);
    }

    wait_for_commits(&broker, 4, 50);
    assert!(broker.generation() > generation);
    service.shutdown().unwrap();

    for p in 0..4 {
        assert_eq!(sink.keys_for(TOPIC, p).len(), 5, "batches for partition {p}");
        assert_eq!(archived_records(&sink, p), expected_records(50));
    }
}

#[test]
fn test_shutdown_flushes_partial_batches_to_local_archive() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    broker.create_topic(TOPIC, 2);
    produce(&broker, 0, 0..15);
    produce(&broker, 1, 0..15);

    let config = test_config(&dir, &[("CONSUMER_COUNT", "1")]);
    let sink = LocalDirectorySink::new(config.local_archive_dir_buf()).unwrap();
    let mut service = ArchiverService::new(config, Arc::new(sink)).unwrap();
    start_service(&mut service, &broker);

    wait_for_commits(&broker, 2, 15);
    service.shutdown().unwrap();

    let archived = files_under(&dir.path().join("archive").join("topics").join(TOPIC));
    assert_eq!(archived.len(), 4);
    for p in 0..2 {
        let mut batches: Vec<_> = archived
            .iter()
            .filter(|path| file_name(path).ends_with(&format!("-{p}")))
            .collect();
        batches.sort_by_key(|path| file_name(path));

        let sizes: Vec<usize> = batches
            .iter()
            .map(|path| read_batch(path, CompressionType::None).len())
            .collect();
        assert_eq!(sizes, vec![10, 5], "batch sizes for partition {p}");
    }

    // Everything staged was moved into the archive
    assert!(files_under(&dir.path().join("staging")).is_empty());
}

#[test]
fn test_gzip_batches_are_readable() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    broker.create_topic(TOPIC, 1);
    produce(&broker, 0, 0..30);

    let sink = Arc::new(RecordingSink::new());
    let config = test_config(&dir, &[("CONSUMER_COUNT", "1"), ("COMPRESSION_TYPE", "GZIP")]);
    let mut service = ArchiverService::new(config, sink.clone()).unwrap();
    start_service(&mut service, &broker);

    wait_for_commits(&broker, 1, 30);
    service.shutdown().unwrap();

    let files = sink.files_for(TOPIC, 0);
    assert_eq!(files.len(), 3);
    assert!(files.iter().all(|path| file_name(path).ends_with(".gz")));

    let records: Vec<String> = files
        .iter()
        .flat_map(|path| read_batch(path, CompressionType::Gzip))
        .collect();
    assert_eq!(records, expected_records(30));
}

#[test]
fn test_failed_commits_are_retried() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    broker.create_topic(TOPIC, 2);
    produce(&broker, 0, 0..20);
    produce(&broker, 1, 0..20);
    broker.fail_next_commits(3);

    let sink = Arc::new(RecordingSink::new());
    let config = test_config(&dir, &[("CONSUMER_COUNT", "1")]);
    let mut service = ArchiverService::new(config, sink.clone()).unwrap();
    start_service(&mut service, &broker);

    wait_for_commits(&broker, 2, 20);
    service.shutdown().unwrap();

    for p in 0..2 {
        assert_eq!(archived_records(&sink, p), expected_records(20));
    }
}
