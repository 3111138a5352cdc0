use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info};

use crate::{
    config::Config,
    consumer::{ConsumerPool, WorkerSettings},
    kafka::{ensure_topics_exist, BrokerClient, ConsumerId, KafkaBrokerClient},
    metrics_server::Readiness,
    upload::UploadSink,
    writer::{BatchWriterSettings, WriteCoordinator},
};

/// The archiver: a pool of consumer workers feeding one write coordinator, whose flushed
/// batches go to an upload sink.
pub struct ArchiverService {
    config: Config,
    coordinator: Arc<WriteCoordinator>,
    sink: Arc<dyn UploadSink>,
    pool: Option<ConsumerPool>,
}

impl ArchiverService {
    /// Validates the configuration and builds the writing side. No consumer is started yet.
    pub fn new(config: Config, sink: Arc<dyn UploadSink>) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for group '{}' and topics '{}'",
                config.kafka_consumer_group, config.kafka_consumer_topics
            )
        })?;

        let staging_dir = config.staging_dir_buf();
        fs::create_dir_all(&staging_dir).with_context(|| {
            format!("Failed to create staging directory {}", staging_dir.display())
        })?;

        let settings = BatchWriterSettings {
            staging_dir,
            capacity_bytes: config.batch_capacity_bytes,
            flush_threshold_bytes: config.flush_threshold_bytes(),
            compression: config.compression()?,
        };
        let coordinator = Arc::new(
            WriteCoordinator::new(settings, config.writer_threads, sink.clone())
                .context("Failed to create write coordinator")?,
        );

        Ok(Self {
            config,
            coordinator,
            sink,
            pool: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<WriteCoordinator> {
        &self.coordinator
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            topics: self.config.topics(),
            poll_timeout: self.config.poll_timeout(),
            commit_interval: self.config.commit_interval(),
        }
    }

    /// Starts `CONSUMER_COUNT` workers with clients built by `create_client`
    pub fn start_with<C, F>(&mut self, create_client: F) -> Result<()>
    where
        C: BrokerClient + 'static,
        F: FnMut(ConsumerId) -> Result<C>,
    {
        if self.pool.is_some() {
            return Err(anyhow!("Service already started"));
        }

        let pool = ConsumerPool::start(
            self.config.consumer_count,
            self.coordinator.clone(),
            self.worker_settings(),
            create_client,
        )?;
        self.pool = Some(pool);

        info!(
            "Archiving topics '{}' for group '{}'",
            self.config.kafka_consumer_topics, self.config.kafka_consumer_group
        );
        Ok(())
    }

    /// Starts the workers against the configured Kafka cluster. Blocks on broker metadata when
    /// topic validation is enabled.
    pub fn start(&mut self) -> Result<()> {
        if self.config.validate_topics {
            let metadata_config = self.config.to_consumer_config("kafka-archiver-metadata");
            ensure_topics_exist(&metadata_config, &self.config.topics())
                .context("Topic validation failed")?;
        }

        let config = self.config.clone();
        self.start_with(move |consumer_id| {
            let client_config = config.to_consumer_config(&format!("kafka-archiver-{consumer_id}"));
            KafkaBrokerClient::new(consumer_id, &client_config, config.max_poll_records)
                .with_context(|| format!("Failed to create Kafka consumer {consumer_id}"))
        })
    }

    /// False once any consumer worker has exited
    pub fn is_healthy(&self) -> bool {
        self.pool.as_ref().is_some_and(ConsumerPool::is_healthy)
    }

    /// Withdraws readiness once a consumer worker has exited. Workers are not restarted, so
    /// readiness is never given back.
    pub fn report_health(&self, readiness: &Readiness) {
        if readiness.is_ready() && !self.is_healthy() {
            error!("A consumer worker has exited, reporting not ready");
            readiness.set(false);
        }
    }

    /// Stops the consumers, which commit and flush what they own, then flushes whatever batches
    /// are left and waits for the sink to finish uploading.
    pub fn shutdown(mut self) -> Result<()> {
        info!("Shutting down archiver service");

        let failed_workers = match self.pool.take() {
            Some(pool) => pool.shutdown().into_iter().filter(Result::is_err).count(),
            None => 0,
        };

        self.coordinator.shutdown();

        self.sink
            .shutdown(self.config.shutdown_timeout())
            .context("Upload sink did not shut down cleanly")?;

        if failed_workers > 0 {
            error!(failed_workers, "Consumer workers stopped with errors");
            return Err(anyhow!("{failed_workers} consumer workers stopped with errors"));
        }

        info!("Archiver service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBroker, MockBrokerClient, RecordingSink};
    use envconfig::Envconfig;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, overrides: &[(&str, &str)]) -> Config {
        let mut env: HashMap<String, String> = HashMap::from([
            (
                "STAGING_DIR".to_string(),
                dir.path().join("staging").display().to_string(),
            ),
            ("KAFKA_CONSUMER_TOPICS".to_string(), "events".to_string()),
            ("CONSUMER_COUNT".to_string(), "2".to_string()),
            ("WRITER_THREADS".to_string(), "2".to_string()),
            ("COMMIT_INTERVAL_MS".to_string(), "20".to_string()),
            ("POLL_TIMEOUT_MS".to_string(), "5".to_string()),
            ("VALIDATE_TOPICS".to_string(), "false".to_string()),
        ]);
        for (key, value) in overrides {
            env.insert(key.to_string(), value.to_string());
        }
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_unknown_compression_fails_before_anything_starts() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, &[("COMPRESSION_TYPE", "lz4")]);

        let err = ArchiverService::new(config, Arc::new(RecordingSink::new()))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("unknown compression type 'lz4'"));
        assert!(!dir.path().join("staging").exists());
    }

    #[test]
    fn test_new_creates_staging_dir() {
        let dir = TempDir::new().unwrap();
        let service =
            ArchiverService::new(test_config(&dir, &[]), Arc::new(RecordingSink::new())).unwrap();

        assert!(dir.path().join("staging").is_dir());
        assert!(!service.is_healthy());
        service.shutdown().unwrap();
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let broker = MockBroker::new();
        broker.create_topic("events", 2);
        let mut service =
            ArchiverService::new(test_config(&dir, &[]), Arc::new(RecordingSink::new())).unwrap();

        service
            .start_with(|_| Ok(MockBrokerClient::new(broker.clone(), 10)))
            .unwrap();
        assert!(service.is_healthy());
        assert!(service
            .start_with(|_| Ok(MockBrokerClient::new(broker.clone(), 10)))
            .is_err());

        service.shutdown().unwrap();
        assert_eq!(broker.member_count(), 0);
    }

    #[test]
    fn test_exited_worker_withdraws_readiness() {
        let dir = TempDir::new().unwrap();
        let broker = MockBroker::new();
        broker.create_topic("events", 2);
        let mut service =
            ArchiverService::new(test_config(&dir, &[]), Arc::new(RecordingSink::new())).unwrap();

        let mut wakeups = Vec::new();
        service
            .start_with(|_| {
                let client = MockBrokerClient::new(broker.clone(), 10);
                wakeups.push(client.wakeup_handle());
                Ok(client)
            })
            .unwrap();

        let readiness = Readiness::default();
        readiness.set(true);
        service.report_health(&readiness);
        assert!(readiness.is_ready());

        // a wakeup without a stop request makes the worker exit with an error
        wakeups[1].wake();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while service.is_healthy() {
            assert!(std::time::Instant::now() < deadline, "worker never exited");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        service.report_health(&readiness);
        assert!(!readiness.is_ready());
        assert!(service.shutdown().is_err());
        assert_eq!(broker.member_count(), 0);
    }
}
