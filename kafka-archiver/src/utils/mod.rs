use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::compression::CompressionType;

/// Suffix carried by batch files until they are flushed
pub const IN_PROGRESS_SUFFIX: &str = ".inprogress";

/// Format a topic as a filesystem-safe directory name.
/// Replaces `/` characters with `_` since `/` would create subdirectories.
pub fn format_topic_dir(topic: &str) -> String {
    topic.replace('/', "_")
}

/// Object-store key for a batch of `topic`/`partition` opened at `created_at`.
///
/// Time buckets are UTC and zero-padded so keys sort lexicographically in time order.
pub fn destination_key(topic: &str, partition: i32, created_at: DateTime<Utc>) -> String {
    format!(
        "topics/{}/year={:04}/month={:02}/day={:02}/hour={:02}/{}-{}",
        topic,
        created_at.year(),
        created_at.month(),
        created_at.day(),
        created_at.hour(),
        created_at.timestamp_millis(),
        partition
    )
}

/// Staging file a batch is written to before it is flushed
pub fn staging_path(
    staging_dir: &Path,
    topic: &str,
    partition: i32,
    created_at: DateTime<Utc>,
    compression: CompressionType,
) -> PathBuf {
    staging_dir.join(format_topic_dir(topic)).join(format!(
        "{}-{}{}{}",
        partition,
        created_at.timestamp_millis(),
        compression.extension(),
        IN_PROGRESS_SUFFIX
    ))
}

/// Path a staged batch is renamed to once its stream is finished
pub fn finished_path(in_progress: &Path) -> PathBuf {
    match in_progress
        .to_str()
        .and_then(|p| p.strip_suffix(IN_PROGRESS_SUFFIX))
    {
        Some(stripped) => PathBuf::from(stripped),
        None => in_progress.to_path_buf(),
    }
}

/// Locks a mutex, recovering the data if a panicking thread poisoned it
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Unwrap a spawn_blocking JoinHandle<Result<T>> into Result<T>, adding context on panic.
pub async fn unwrap_blocking_task<T>(
    handle: tokio::task::JoinHandle<anyhow::Result<T>>,
    panic_context: &str,
) -> anyhow::Result<T>
where
    T: Send + 'static,
{
    match handle.await {
        Ok(result) => result,
        Err(join_err) => Err(anyhow::Error::from(join_err).context(panic_context.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 5, 9, 1).unwrap()
    }

    #[test]
    fn test_destination_key_is_zero_padded() {
        let created_at = sample_time();
        let key = destination_key("events", 3, created_at);
        assert_eq!(
            key,
            format!(
                "topics/events/year=2024/month=03/day=07/hour=05/{}-3",
                created_at.timestamp_millis()
            )
        );
    }

    #[test]
    fn test_staging_path_layout() {
        let created_at = sample_time();
        let path = staging_path(
            Path::new("/tmp/staging"),
            "team/events",
            12,
            created_at,
            CompressionType::Gzip,
        );
        assert_eq!(
            path,
            PathBuf::from(format!(
                "/tmp/staging/team_events/12-{}.gz.inprogress",
                created_at.timestamp_millis()
            ))
        );
    }

    #[test]
    fn test_finished_path_strips_suffix() {
        let path = PathBuf::from("/tmp/staging/events/0-1.txt.inprogress");
        assert_eq!(
            finished_path(&path),
            PathBuf::from("/tmp/staging/events/0-1.txt")
        );
        let done = PathBuf::from("/tmp/staging/events/0-1.txt");
        assert_eq!(finished_path(&done), done);
    }

    #[tokio::test]
    async fn test_unwrap_blocking_task_panic() {
        let handle = tokio::task::spawn_blocking(|| -> anyhow::Result<i32> { panic!("oops") });

        let result = unwrap_blocking_task(handle, "shutdown panicked").await;

        let err_str = format!("{:#}", result.unwrap_err());
        assert!(err_str.contains("shutdown panicked"));
    }
}
