//! Worker - one of N concurrent processors inside a partition pipeline
//!
//! Each worker owns a bounded queue. Items are processed one at a time through
//! the retry wrapper; success confirms the item's window slot, final failure
//! hands the message to the user fallback and leaves the slot unconfirmed.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::handler::MessageHandler;
use crate::kafka::types::{ConsumedMessage, Partition};
use crate::metrics_consts::{
    WORKER_FALLBACKS, WORKER_MESSAGES_IN_PROGRESS, WORKER_MESSAGES_PROCESSED,
    WORKER_PROCESSING_DURATION_MS,
};
use crate::pipeline::offset_window::Slot;
use crate::pipeline::retry::RetryPolicy;

/// A message paired with the window slot that tracks it
#[derive(Debug)]
pub struct WorkItem {
    pub message: ConsumedMessage,
    pub slot: Slot,
}

/// Sending side of a worker, held by the orchestrator
pub struct Worker {
    id: usize,
    sender: mpsc::Sender<WorkItem>,
}

impl Worker {
    /// Create a worker and the loop that drains its queue. The loop must be
    /// spawned by the caller.
    pub fn new(id: usize, partition: Partition, queue_capacity: usize) -> (Self, WorkerLoop) {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        (
            Self { id, sender },
            WorkerLoop {
                id,
                partition,
                receiver,
            },
        )
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Enqueue with backpressure. Returns false if cancelled first or the
    /// worker loop is gone; the item (and its slot) is dropped in that case.
    pub async fn push(&self, item: WorkItem, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.sender.send(item) => sent.is_ok(),
        }
    }
}

pub struct WorkerLoop {
    id: usize,
    partition: Partition,
    receiver: mpsc::Receiver<WorkItem>,
}

impl WorkerLoop {
    pub async fn run(
        mut self,
        handler: Arc<dyn MessageHandler>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) {
        let topic = self.partition.topic().to_string();
        let partition = self.partition.partition_number().to_string();
        let worker_id = self.id.to_string();
        let in_progress = metrics::gauge!(
            WORKER_MESSAGES_IN_PROGRESS,
            "topic" => topic.clone(),
            "partition" => partition.clone(),
            "worker_id" => worker_id.clone(),
        );

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = self.receiver.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let WorkItem { message, slot } = item;

            in_progress.increment(1.0);
            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    in_progress.decrement(1.0);
                    break;
                }
                result = retry.perform(handler.as_ref(), &message, self.id) => result,
            };
            in_progress.decrement(1.0);

            metrics::histogram!(
                WORKER_PROCESSING_DURATION_MS,
                "topic" => topic.clone(),
                "partition" => partition.clone(),
            )
            .record(start.elapsed().as_millis() as f64);

            match result {
                Ok(()) => {
                    slot.mark_complete();
                    metrics::counter!(
                        WORKER_MESSAGES_PROCESSED,
                        "topic" => topic.clone(),
                        "partition" => partition.clone(),
                        "worker_id" => worker_id.clone(),
                    )
                    .increment(1);
                }
                Err(e) => {
                    error!(
                        topic = %topic,
                        partition = self.partition.partition_number(),
                        offset = message.offset(),
                        worker_id = self.id,
                        error = ?e,
                        "Message failed after retries, handing to fallback"
                    );
                    metrics::counter!(
                        WORKER_FALLBACKS,
                        "topic" => topic.clone(),
                        "partition" => partition.clone(),
                        "worker_id" => worker_id.clone(),
                    )
                    .increment(1);
                    handler.fallback(&message, &e).await;
                    // slot dropped unconfirmed, the watermark stops here
                    drop(slot);
                }
            }
        }

        debug!(
            topic = %topic,
            partition = self.partition.partition_number(),
            worker_id = self.id,
            "Worker stopped"
        );
    }
}
