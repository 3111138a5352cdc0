use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;

use crate::compression::CompressionType;
use crate::kafka::config::ConsumerConfigBuilder;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown compression type '{0}', expected one of none, gzip, snappy")]
    UnknownCompression(String),

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("no topics configured in KAFKA_CONSUMER_TOPICS")]
    NoTopics,

    #[error("topics not found on the broker: {}", .0.join(", "))]
    MissingTopics(Vec<String>),
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-archiver")]
    pub kafka_consumer_group: String,

    /// Comma-separated list of topics to archive
    #[envconfig(default = "events")]
    pub kafka_consumer_topics: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "2097152")] // 2MiB
    pub kafka_max_partition_fetch_bytes: u32,

    // Consumer and writer pools
    #[envconfig(default = "2")]
    pub consumer_count: usize,

    #[envconfig(default = "4")]
    pub writer_threads: usize,

    // Batch files
    #[envconfig(default = "none")]
    pub compression_type: String,

    #[envconfig(default = "10485760")] // 10MiB of payload per batch
    pub batch_capacity_bytes: i64,

    #[envconfig(default = "10")]
    pub flush_threshold_mb: u64,

    #[envconfig(default = "/tmp/kafka-archiver/staging")]
    pub staging_dir: String,

    // Polling and commits
    #[envconfig(default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "2000")]
    pub poll_timeout_ms: u64,

    /// Upper bound on records returned by one poll
    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "true")]
    pub validate_topics: bool,

    // Upload sink. Batches are moved to LOCAL_ARCHIVE_DIR when no bucket is configured.
    pub s3_bucket: Option<String>,

    #[envconfig(default = "/tmp/kafka-archiver/archive")]
    pub local_archive_dir: String,

    #[envconfig(default = "us-east-1")]
    pub aws_region: String,

    pub s3_endpoint: Option<String>,

    #[envconfig(default = "false")]
    pub s3_force_path_style: bool,

    #[envconfig(default = "120")]
    pub s3_timeout_secs: u64,

    #[envconfig(default = "8")]
    pub upload_concurrency: usize,

    #[envconfig(default = "60")]
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Checks everything that can be checked without talking to the broker.
    /// Nothing is started when this fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compression()?;

        if self.topics().is_empty() {
            return Err(ConfigError::NoTopics);
        }
        if self.consumer_count == 0 {
            return Err(invalid("CONSUMER_COUNT", "must be at least 1"));
        }
        if self.writer_threads == 0 {
            return Err(invalid("WRITER_THREADS", "must be at least 1"));
        }
        if self.batch_capacity_bytes <= 0 {
            return Err(invalid("BATCH_CAPACITY_BYTES", "must be positive"));
        }
        if self.flush_threshold_mb == 0 {
            return Err(invalid("FLUSH_THRESHOLD_MB", "must be positive"));
        }
        if self.commit_interval_ms == 0 {
            return Err(invalid("COMMIT_INTERVAL_MS", "must be positive"));
        }
        if self.max_poll_records == 0 {
            return Err(invalid("MAX_POLL_RECORDS", "must be at least 1"));
        }
        if self.upload_concurrency == 0 {
            return Err(invalid("UPLOAD_CONCURRENCY", "must be at least 1"));
        }
        match self.kafka_consumer_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(invalid(
                    "KAFKA_CONSUMER_OFFSET_RESET",
                    &format!("'{other}' is not earliest or latest"),
                ))
            }
        }

        Ok(())
    }

    pub fn compression(&self) -> Result<CompressionType, ConfigError> {
        CompressionType::from_name(&self.compression_type)
    }

    pub fn topics(&self) -> Vec<String> {
        self.kafka_consumer_topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn staging_dir_buf(&self) -> PathBuf {
        PathBuf::from(&self.staging_dir)
    }

    pub fn local_archive_dir_buf(&self) -> PathBuf {
        PathBuf::from(&self.local_archive_dir)
    }

    /// Flush threshold in bytes
    pub fn flush_threshold_bytes(&self) -> u64 {
        self.flush_threshold_mb.saturating_mul(1024 * 1024)
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn s3_timeout(&self) -> Duration {
        Duration::from_secs(self.s3_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// rdkafka configuration for one consumer of the pool
    pub fn to_consumer_config(&self, client_id: &str) -> rdkafka::ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_max_partition_fetch_bytes(self.kafka_max_partition_fetch_bytes)
            .with_client_id(client_id)
            .build()
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config_from(&[]);
        config.validate().unwrap();

        assert_eq!(config.topics(), vec!["events".to_string()]);
        assert_eq!(config.compression().unwrap(), CompressionType::None);
        assert_eq!(config.commit_interval(), Duration::from_millis(5000));
        assert_eq!(config.flush_threshold_bytes(), 10 * 1024 * 1024);
        assert!(config.s3_bucket.is_none());
    }

    #[test]
    fn test_topics_are_split_and_trimmed() {
        let config = config_from(&[("KAFKA_CONSUMER_TOPICS", "events, clicks,,views ")]);
        assert_eq!(config.topics(), vec!["events", "clicks", "views"]);
    }

    #[test]
    fn test_unknown_compression_fails_validation() {
        let config = config_from(&[("COMPRESSION_TYPE", "brotli")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownCompression(_))
        ));
    }

    #[test]
    fn test_empty_topics_fail_validation() {
        let config = config_from(&[("KAFKA_CONSUMER_TOPICS", " , ")]);
        assert!(matches!(config.validate(), Err(ConfigError::NoTopics)));
    }

    #[test]
    fn test_zero_pools_fail_validation() {
        let config = config_from(&[("CONSUMER_COUNT", "0")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                name: "CONSUMER_COUNT",
                ..
            })
        ));

        let config = config_from(&[("WRITER_THREADS", "0")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_consumer_config_carries_client_id() {
        let config = config_from(&[("KAFKA_CONSUMER_GROUP", "archivers")]);
        let client_config = config.to_consumer_config("kafka-archiver-1");
        assert_eq!(client_config.get("group.id"), Some("archivers"));
        assert_eq!(client_config.get("client.id"), Some("kafka-archiver-1"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
    }
}
