#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use envconfig::Envconfig;
use tempfile::TempDir;

use kafka_archiver::compression::CompressionType;
use kafka_archiver::config::Config;
use kafka_archiver::kafka::PartitionKey;
use kafka_archiver::test_utils::MockBroker;

pub const TOPIC: &str = "events";

/// Config for a service running against the mock broker, staging under `dir`
pub fn test_config(dir: &TempDir, overrides: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = [
        ("KAFKA_CONSUMER_TOPICS", TOPIC),
        ("CONSUMER_COUNT", "2"),
        ("WRITER_THREADS", "4"),
        ("BATCH_CAPACITY_BYTES", "1000"),
        ("COMMIT_INTERVAL_MS", "20"),
        ("POLL_TIMEOUT_MS", "5"),
        ("VALIDATE_TOPICS", "false"),
        ("SHUTDOWN_TIMEOUT_SECS", "5"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    env.insert(
        "STAGING_DIR".to_string(),
        dir.path().join("staging").display().to_string(),
    );
    env.insert(
        "LOCAL_ARCHIVE_DIR".to_string(),
        dir.path().join("archive").display().to_string(),
    );
    for (key, value) in overrides {
        env.insert(key.to_string(), value.to_string());
    }
    Config::init_from_hashmap(&env).unwrap()
}

/// 100-byte payload whose content is the record number, so files can be checked for order
pub fn payload(n: usize) -> String {
    format!("{n:0>100}")
}

pub fn produce(broker: &MockBroker, partition: i32, range: std::ops::Range<usize>) {
    for n in range {
        broker.produce(TOPIC, partition, payload(n));
    }
}

pub fn partition(number: i32) -> PartitionKey {
    PartitionKey::new(TOPIC, number)
}

pub fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn wait_for_commits(broker: &MockBroker, partitions: i32, offset: i64) {
    wait_until(
        &format!("offset {offset} committed on {partitions} partitions"),
        Duration::from_secs(20),
        || (0..partitions).all(|p| broker.committed_offset(&partition(p)) == Some(offset)),
    );
}

/// Reads every record line of a batch file
pub fn read_batch(path: &Path, compression: CompressionType) -> Vec<String> {
    let file = fs::File::open(path).unwrap();
    BufReader::new(compression.wrap_reader(file))
        .lines()
        .map(Result::unwrap)
        .collect()
}

/// Every file below `dir`, sorted by path
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}
