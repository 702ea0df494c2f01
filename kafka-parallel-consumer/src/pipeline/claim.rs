//! Claim processing - one independent pipeline per partition claim
//!
//! `consume_claim` wires the offset window, workers, watermark scanner, commit
//! scheduler and orchestrator together under a child cancellation token, feeds
//! the claim's message stream into the orchestrator, and tears everything
//! down when the claim ends. Returning an error tells the consumer to let the
//! partition be rebalanced.

use std::sync::Arc;

use futures::{pin_mut, Stream, StreamExt};
use rdkafka::error::KafkaResult;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::handler::{GiveUpHandler, LoggingGiveUpHandler, MessageHandler};
use crate::kafka::types::{ConsumedMessage, Partition};
use crate::metrics_consts::{CLAIMS_ACTIVE, CLAIMS_TERMINATED, WINDOW_CAPACITY, WORKER_COUNT};
use crate::pipeline::committer::{ClaimSession, CommitSchedule, CommitScheduler};
use crate::pipeline::offset_window::OffsetWindow;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::router::Router;
use crate::pipeline::worker::Worker;

/// Builds and runs partition pipelines. Cheap to clone; every claim shares the
/// same handlers and settings.
#[derive(Clone)]
pub struct ClaimProcessor {
    config: PipelineConfig,
    handler: Arc<dyn MessageHandler>,
    give_up_handler: Arc<dyn GiveUpHandler>,
}

impl ClaimProcessor {
    pub fn new(config: PipelineConfig, handler: Arc<dyn MessageHandler>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            handler,
            give_up_handler: Arc::new(LoggingGiveUpHandler),
        })
    }

    pub fn with_give_up_handler(mut self, give_up_handler: Arc<dyn GiveUpHandler>) -> Self {
        self.give_up_handler = give_up_handler;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one partition claim until `cancel` fires, the stream ends, or
    /// the commit scheduler gives up. Broker errors on the stream and give-up
    /// are returned as errors.
    pub async fn consume_claim<S>(
        &self,
        partition: Partition,
        session: Arc<dyn ClaimSession>,
        messages: S,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>
    where
        S: Stream<Item = KafkaResult<ConsumedMessage>>,
    {
        let config = &self.config;
        let claim_cancel = cancel.child_token();
        let (give_up_tx, mut give_up_rx) = mpsc::channel::<PipelineError>(1);
        let mut tasks = JoinSet::new();

        let window = OffsetWindow::new(config.window_capacity, config.backpressure_interval)?;
        let view = window.view();

        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let (worker, worker_loop) = Worker::new(id, partition.clone(), config.window_capacity);
            tasks.spawn(worker_loop.run(
                self.handler.clone(),
                config.retry_policy(),
                claim_cancel.clone(),
            ));
            workers.push(worker);
        }

        tasks.spawn(
            view.clone()
                .run_scanner(config.watermark_scan_interval, claim_cancel.clone()),
        );

        let scheduler = CommitScheduler::new(
            partition.clone(),
            view,
            session,
            self.give_up_handler.clone(),
            CommitSchedule {
                commit_interval: config.commit_interval,
                give_up_check_interval: config.give_up_check_interval,
                give_up_after: config.give_up_after,
            },
            give_up_tx,
        );
        tasks.spawn(scheduler.run(claim_cancel.clone()));

        let (orchestrator, orchestrator_loop) = Orchestrator::new(
            partition.clone(),
            config.window_capacity,
            window,
            Router::new(config.routing_mode),
            workers,
        );
        tasks.spawn(orchestrator_loop.run(claim_cancel.clone()));

        let topic_label = partition.topic().to_string();
        let partition_label = partition.partition_number().to_string();
        metrics::gauge!(WINDOW_CAPACITY, "topic" => topic_label.clone(), "partition" => partition_label.clone())
            .set(config.window_capacity as f64);
        metrics::gauge!(WORKER_COUNT, "topic" => topic_label.clone(), "partition" => partition_label.clone())
            .set(config.worker_count as f64);
        metrics::gauge!(CLAIMS_ACTIVE).increment(1.0);

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            workers = config.worker_count,
            window_capacity = config.window_capacity,
            routing = %config.routing_mode,
            "Claim started"
        );

        pin_mut!(messages);
        let mut result = loop {
            tokio::select! {
                biased;
                _ = claim_cancel.cancelled() => break Ok(()),
                Some(give_up) = give_up_rx.recv() => break Err(give_up),
                next = messages.next() => match next {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(PipelineError::Kafka(e)),
                    Some(Ok(message)) => {
                        // A full pipeline must not hide a give-up
                        tokio::select! {
                            biased;
                            Some(give_up) = give_up_rx.recv() => break Err(give_up),
                            pushed = orchestrator.push(message, &claim_cancel) => {
                                if !pushed && !claim_cancel.is_cancelled() {
                                    break Err(PipelineError::TaskFailed(
                                        "orchestrator stopped receiving".to_string(),
                                    ));
                                }
                            }
                        }
                    }
                },
            }
        };

        claim_cancel.cancel();
        drop(orchestrator);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = %e,
                    "Pipeline task failed"
                );
                if result.is_ok() {
                    result = Err(PipelineError::TaskFailed(e.to_string()));
                }
            }
        }
        metrics::gauge!(CLAIMS_ACTIVE).decrement(1.0);

        match &result {
            Ok(()) => info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Claim stopped"
            ),
            Err(e) => {
                let reason = match e {
                    PipelineError::CommitGiveUp { .. } => "commit_give_up",
                    PipelineError::Kafka(_) => "kafka_error",
                    PipelineError::Config(_) => "config",
                    PipelineError::TaskFailed(_) => "task_failed",
                };
                metrics::counter!(
                    CLAIMS_TERMINATED,
                    "topic" => topic_label,
                    "partition" => partition_label,
                    "reason" => reason,
                )
                .increment(1);
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = %e,
                    "Claim terminated"
                );
            }
        }

        result
    }
}
