use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kafka::types::{ConsumedMessage, Partition};
use crate::metrics_consts::WINDOW_ADMIT_WAIT_MS;
use crate::pipeline::offset_window::OffsetWindow;
use crate::pipeline::router::Router;
use crate::pipeline::worker::{WorkItem, Worker};

/// Entry point of a partition pipeline. Messages pushed here are admitted into
/// the offset window in arrival order and routed to a worker.
pub struct Orchestrator {
    sender: mpsc::Sender<ConsumedMessage>,
}

impl Orchestrator {
    pub fn new(
        partition: Partition,
        queue_capacity: usize,
        window: OffsetWindow,
        router: Router,
        workers: Vec<Worker>,
    ) -> (Self, OrchestratorLoop) {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        (
            Self { sender },
            OrchestratorLoop {
                partition,
                receiver,
                window,
                router,
                workers,
            },
        )
    }

    /// Enqueue with backpressure. Returns false if cancelled first or the
    /// receive loop has stopped.
    pub async fn push(&self, message: ConsumedMessage, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.sender.send(message) => sent.is_ok(),
        }
    }
}

pub struct OrchestratorLoop {
    partition: Partition,
    receiver: mpsc::Receiver<ConsumedMessage>,
    window: OffsetWindow,
    router: Router,
    workers: Vec<Worker>,
}

impl OrchestratorLoop {
    pub async fn run(mut self, cancel: CancellationToken) {
        let admit_wait = metrics::histogram!(
            WINDOW_ADMIT_WAIT_MS,
            "topic" => self.partition.topic().to_string(),
            "partition" => self.partition.partition_number().to_string(),
        );

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = self.receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let start = Instant::now();
            let Some(slot) = self.window.admit(message.offset(), &cancel).await else {
                break;
            };
            admit_wait.record(start.elapsed().as_millis() as f64);

            let target = self
                .router
                .qualify(message.routing_key(), self.workers.len());
            let worker = &self.workers[target];
            if !worker.push(WorkItem { message, slot }, &cancel).await {
                if !cancel.is_cancelled() {
                    warn!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        worker_id = worker.id(),
                        "Worker queue closed, stopping orchestrator"
                    );
                }
                break;
            }
        }

        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            "Orchestrator stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::RoutingMode;
    use crate::pipeline::retry::RetryPolicy;
    use crate::test_utils::{messages, test_partition, RecordingHandler};

    #[tokio::test]
    async fn test_round_robin_spreads_over_workers_and_confirms_all() {
        let partition = test_partition();
        let cancel = CancellationToken::new();
        let window = OffsetWindow::new(16, Duration::from_millis(5)).unwrap();
        let view = window.view();
        let handler = Arc::new(RecordingHandler::new());

        let mut workers = Vec::new();
        let mut tasks = Vec::new();
        for id in 0..3 {
            let (worker, worker_loop) = Worker::new(id, partition.clone(), 16);
            tasks.push(tokio::spawn(worker_loop.run(
                handler.clone(),
                RetryPolicy::default(),
                cancel.clone(),
            )));
            workers.push(worker);
        }

        let (orchestrator, orchestrator_loop) = Orchestrator::new(
            partition.clone(),
            16,
            window,
            Router::new(RoutingMode::RoundRobin),
            workers,
        );
        tasks.push(tokio::spawn(orchestrator_loop.run(cancel.clone())));

        for message in messages(&partition, 0..9) {
            assert!(orchestrator.push(message, &cancel).await);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        view.scan();

        let mut processed = handler.processed();
        processed.sort_unstable();
        assert_eq!(processed, (0..9).collect::<Vec<_>>());
        assert_eq!(view.commit_safe_offset(), Some(8));

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_push_returns_false_after_cancel() {
        let partition = test_partition();
        let cancel = CancellationToken::new();
        let window = OffsetWindow::new(1, Duration::from_millis(5)).unwrap();

        let (orchestrator, _orchestrator_loop) = Orchestrator::new(
            partition.clone(),
            1,
            window,
            Router::new(RoutingMode::KeyDistribute),
            Vec::new(),
        );

        let mut batch = messages(&partition, 0..2).into_iter();
        assert!(orchestrator.push(batch.next().unwrap(), &cancel).await);

        cancel.cancel();
        assert!(!orchestrator.push(batch.next().unwrap(), &cancel).await);
    }
}
