use std::future::ready;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_parallel_consumer::config::Config;
use kafka_parallel_consumer::handler::MessageHandler;
use kafka_parallel_consumer::kafka::consumer::{ParallelConsumer, PauseHandle};
use kafka_parallel_consumer::kafka::types::ConsumedMessage;
use kafka_parallel_consumer::metrics::{serve, setup_metrics_routes};
use kafka_parallel_consumer::pipeline::claim::ClaimProcessor;

fn setup_tracing() -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

pub async fn index() -> &'static str {
    "kafka parallel consumer"
}

/// Logs every message it sees; stands in for real business logic.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn perform(&self, message: &ConsumedMessage) -> anyhow::Result<()> {
        info!(
            topic = message.topic(),
            partition = message.partition_number(),
            offset = message.offset(),
            key = %String::from_utf8_lossy(message.routing_key()),
            value_bytes = message.value.as_ref().map_or(0, Vec::len),
            "Processed message"
        );
        Ok(())
    }

    async fn fallback(&self, message: &ConsumedMessage, error: &anyhow::Error) {
        error!(
            topic = message.topic(),
            partition = message.partition_number(),
            offset = message.offset(),
            error = ?error,
            "Message could not be processed"
        );
    }
}

async fn shutdown_signal(shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutdown signal received");
    shutdown.cancel();
    Ok(())
}

/// SIGUSR1 toggles consumption of the current assignment
async fn pause_toggle(pause: PauseHandle, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut usr1 =
        signal(SignalKind::user_defined1()).context("failed to register SIGUSR1 handler")?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            received = usr1.recv() => {
                if received.is_none() {
                    return Ok(());
                }
                match pause.toggle() {
                    Ok(true) => info!("Consumption paused"),
                    Ok(false) => info!("Consumption resumed"),
                    Err(e) => warn!("Failed to toggle consumption: {}", e),
                }
            }
        }
    }
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing()?;
    info!("Starting kafka parallel consumer...");

    let config = Config::init_from_env().context("failed to load configuration")?;
    let pipeline_config = config
        .pipeline_config()
        .context("invalid pipeline configuration")?;

    info!(
        topic = config.kafka_consumer_topic,
        group_id = config.kafka_consumer_group,
        window_capacity = pipeline_config.window_capacity,
        workers = pipeline_config.worker_count,
        routing = %pipeline_config.routing_mode,
        max_retries = pipeline_config.max_retries,
        "Configuration loaded"
    );

    // Health check server
    let bind = config.bind_address();
    let health_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    let health_router = setup_metrics_routes(health_router)?;

    tokio::task::spawn(async move {
        if let Err(e) = serve(health_router, &bind).await {
            error!("Health server failed: {}", e);
        }
    });

    let processor = ClaimProcessor::new(pipeline_config, Arc::new(LoggingHandler))?;
    let consumer = ParallelConsumer::from_config(
        &config.consumer_config(),
        &config.kafka_consumer_topic,
        processor,
    )
    .context("failed to create kafka consumer")?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal(signal_shutdown.clone()).await {
            error!(error = ?e, "Shutdown signal handling failed, stopping");
            signal_shutdown.cancel();
        }
    });
    let pause = consumer.pause_handle();
    let pause_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = pause_toggle(pause, pause_shutdown).await {
            warn!(error = ?e, "Pause toggle unavailable");
        }
    });

    consumer.run(shutdown).await?;

    info!("Kafka parallel consumer shut down");
    Ok(())
}
