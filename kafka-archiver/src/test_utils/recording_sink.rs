use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::test_utils::lock;
use crate::upload::UploadSink;

/// Keys end in `<epochMillis>-<partition>` under `topics/<topic>/`
fn key_matches(key: &str, topic: &str, partition: i32) -> bool {
    let Some(rest) = key.strip_prefix("topics/").and_then(|k| k.strip_prefix(topic)) else {
        return false;
    };
    let file_name = rest.rsplit('/').next().unwrap_or_default();
    rest.starts_with('/')
        && file_name
            .split_once('-')
            .is_some_and(|(_, p)| p == partition.to_string())
}

#[derive(Default)]
struct Gate {
    blocked: bool,
    released: bool,
}

/// Upload sink that keeps every submission in memory and leaves the files where they are.
///
/// Built with `blocking_at(n)`, the n-th `submit` parks the submitting writer thread until
/// `release` is called, which lets tests freeze a writing task at a known record.
#[derive(Default)]
pub struct RecordingSink {
    submissions: Mutex<Vec<(PathBuf, String)>>,
    block_at: Option<usize>,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocking_at(submission: usize) -> Self {
        Self {
            block_at: Some(submission),
            ..Self::default()
        }
    }

    /// Waits until the blocking submission is reached. Returns false on timeout.
    pub fn wait_until_blocked(&self, timeout: Duration) -> bool {
        let gate = lock(&self.gate);
        let (gate, _) = self
            .gate_changed
            .wait_timeout_while(gate, timeout, |g| !g.blocked)
            .unwrap_or_else(|e| e.into_inner());
        gate.blocked
    }

    pub fn release(&self) {
        lock(&self.gate).released = true;
        self.gate_changed.notify_all();
    }

    pub fn submissions(&self) -> Vec<(PathBuf, String)> {
        lock(&self.submissions).clone()
    }

    pub fn submission_count(&self) -> usize {
        lock(&self.submissions).len()
    }

    /// Destination keys submitted for one partition, in submission order
    pub fn keys_for(&self, topic: &str, partition: i32) -> Vec<String> {
        lock(&self.submissions)
            .iter()
            .map(|(_, key)| key)
            .filter(|key| key_matches(key, topic, partition))
            .cloned()
            .collect()
    }

    /// Files submitted for one partition, in submission order
    pub fn files_for(&self, topic: &str, partition: i32) -> Vec<PathBuf> {
        lock(&self.submissions)
            .iter()
            .filter(|(_, key)| key_matches(key, topic, partition))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

impl UploadSink for RecordingSink {
    fn submit(&self, file: PathBuf, destination_key: String) {
        let count = {
            let mut submissions = lock(&self.submissions);
            submissions.push((file, destination_key));
            submissions.len()
        };

        if self.block_at == Some(count) {
            let mut gate = lock(&self.gate);
            gate.blocked = true;
            self.gate_changed.notify_all();
            while !gate.released {
                gate = self
                    .gate_changed
                    .wait(gate)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }

    fn shutdown(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
