use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_archiver::{
    config::Config,
    metrics_server::{health_router, serve, setup_metrics_routes, Readiness},
    service::ArchiverService,
    upload::{LocalDirectorySink, S3UploadSink, UploadSink},
    utils::unwrap_blocking_task,
};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

fn setup_tracing() {
    let log_layer = fmt::layer().with_target(true).with_thread_names(true).with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config, readiness: Readiness) -> Result<JoinHandle<()>> {
    let router = setup_metrics_routes(health_router(readiness))?;
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server stopped: {e:#}");
        }
    }))
}

async fn create_sink(config: &Config) -> Result<Arc<dyn UploadSink>> {
    match &config.s3_bucket {
        Some(bucket) => {
            let sink = S3UploadSink::new(config, bucket.clone())
                .await
                .with_context(|| format!("Failed to create S3 upload sink for bucket '{bucket}'"))?;
            Ok(Arc::new(sink))
        }
        None => {
            info!(
                "S3_BUCKET not set, archiving to local directory {}",
                config.local_archive_dir
            );
            let sink = LocalDirectorySink::new(config.local_archive_dir_buf())?;
            Ok(Arc::new(sink))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting Kafka archiver");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let readiness = Readiness::default();
    let server_handle = start_server(&config, readiness.clone())?;
    info!("Started metrics server on {}", config.bind_address());

    let sink = create_sink(&config).await?;
    let mut service = ArchiverService::new(config, sink)?;

    // Consumer startup talks to the brokers synchronously
    let service = unwrap_blocking_task(
        tokio::task::spawn_blocking(move || -> Result<ArchiverService> {
            service.start()?;
            Ok(service)
        }),
        "Consumer startup panicked",
    )
    .await?;
    readiness.set(true);

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);
    let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    loop {
        tokio::select! {
            signal = &mut shutdown_signal => {
                signal.context("Failed to listen for shutdown signal")?;
                break;
            }
            _ = health_check.tick() => service.report_health(&readiness),
        }
    }
    info!("Received shutdown signal, shutting down gracefully...");
    readiness.set(false);

    // The S3 sink blocks on the runtime handle while it waits for uploads
    let result = unwrap_blocking_task(
        tokio::task::spawn_blocking(move || service.shutdown()),
        "Service shutdown panicked",
    )
    .await;

    server_handle.abort();

    match &result {
        Ok(()) => info!("Kafka archiver stopped"),
        Err(e) => error!("Kafka archiver stopped with errors: {e:#}"),
    }
    result
}
