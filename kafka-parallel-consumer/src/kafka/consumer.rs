//! Parallel Consumer - group consumer running one pipeline per assigned partition
//!
//! Messages are received on the shared consumer and dispatched to the bounded
//! channel of their partition's claim. Assign events start claims, revoke
//! events stop them.
//! A claim that ends with an error (commit give-up, broker error) stops every
//! claim and re-subscribes, so the group rebalances and consumption restarts
//! from the last committed offsets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::kafka::context::{ClaimContext, ClaimEvent, ClaimEventReceiver};
use crate::kafka::session::KafkaSession;
use crate::kafka::types::{ConsumedMessage, Partition};
use crate::metrics_consts::{KAFKA_RECV_ERRORS, SESSION_RESTARTS};
use crate::pipeline::claim::ClaimProcessor;

struct RunningClaim {
    generation: u64,
    sender: mpsc::Sender<KafkaResult<ConsumedMessage>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ClaimDone {
    partition: Partition,
    generation: u64,
    result: Result<(), PipelineError>,
}

/// Pauses and resumes fetching for the consumer's current assignment.
/// Partitions assigned after a pause start unpaused.
#[derive(Clone)]
pub struct PauseHandle {
    consumer: Arc<StreamConsumer<ClaimContext>>,
    paused: Arc<AtomicBool>,
}

impl PauseHandle {
    pub fn pause_all(&self) -> KafkaResult<()> {
        let assignment = self.consumer.assignment()?;
        self.consumer.pause(&assignment)?;
        self.paused.store(true, Ordering::SeqCst);
        info!("Paused {} partitions", assignment.count());
        Ok(())
    }

    pub fn resume_all(&self) -> KafkaResult<()> {
        let assignment = self.consumer.assignment()?;
        self.consumer.resume(&assignment)?;
        self.paused.store(false, Ordering::SeqCst);
        info!("Resumed {} partitions", assignment.count());
        Ok(())
    }

    /// Flip between paused and resumed. Returns true if now paused.
    pub fn toggle(&self) -> KafkaResult<bool> {
        if self.is_paused() {
            self.resume_all()?;
            Ok(false)
        } else {
            self.pause_all()?;
            Ok(true)
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

pub struct ParallelConsumer {
    consumer: Arc<StreamConsumer<ClaimContext>>,
    events: ClaimEventReceiver,
    topic: String,
    processor: ClaimProcessor,
    claims: HashMap<Partition, RunningClaim>,
    next_generation: u64,
    done_tx: mpsc::UnboundedSender<ClaimDone>,
    done_rx: mpsc::UnboundedReceiver<ClaimDone>,
    paused: Arc<AtomicBool>,
}

impl ParallelConsumer {
    pub fn from_config(
        config: &ClientConfig,
        topic: &str,
        processor: ClaimProcessor,
    ) -> KafkaResult<Self> {
        let (context, events) = ClaimContext::new();
        let consumer: StreamConsumer<ClaimContext> = config.create_with_context(context)?;
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        Ok(Self {
            consumer: Arc::new(consumer),
            events,
            topic: topic.to_string(),
            processor,
            claims: HashMap::new(),
            next_generation: 0,
            done_tx,
            done_rx,
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pause_handle(&self) -> PauseHandle {
        PauseHandle {
            consumer: self.consumer.clone(),
            paused: self.paused.clone(),
        }
    }

    /// Consume until `shutdown` is cancelled. Claims are stopped on the way out
    /// without a final commit; work done since the last commit tick is redelivered.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        self.consumer.subscribe(&[self.topic.as_str()])?;
        info!(topic = %self.topic, "Subscribed, starting parallel consumption");

        let consumer = self.consumer.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping claims");
                    break;
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event, &shutdown);
                }
                Some(done) = self.done_rx.recv() => {
                    self.handle_claim_done(done).await?;
                }
                received = consumer.recv() => {
                    let received = received.map(|msg| ConsumedMessage::from_borrowed_message(&msg));
                    match received {
                        Ok(message) => self.dispatch(message, &shutdown).await,
                        Err(e) => {
                            error!("Error receiving message: {}", e);
                            metrics::counter!(KAFKA_RECV_ERRORS).increment(1);
                        }
                    }
                }
            }
        }

        self.stop_all_claims().await;
        info!("Parallel consumer stopped");
        Ok(())
    }

    fn handle_event(&mut self, event: ClaimEvent, shutdown: &CancellationToken) {
        match event {
            ClaimEvent::Assigned(partitions) => {
                for partition in partitions {
                    self.ensure_claim(&partition, shutdown);
                }
            }
            ClaimEvent::Revoked(partitions) => {
                for partition in partitions {
                    if let Some(claim) = self.claims.remove(&partition) {
                        info!(partition = %partition, "Stopping claim for revoked partition");
                        claim.cancel.cancel();
                    }
                }
            }
        }
    }

    async fn handle_claim_done(&mut self, done: ClaimDone) -> Result<(), PipelineError> {
        let current = self
            .claims
            .get(&done.partition)
            .is_some_and(|claim| claim.generation == done.generation);
        if !current {
            // Already stopped by a revoke or restart
            return Ok(());
        }
        self.claims.remove(&done.partition);

        match done.result {
            Ok(()) => {
                debug!(partition = %done.partition, "Claim finished");
                Ok(())
            }
            Err(e) => {
                warn!(
                    partition = %done.partition,
                    error = %e,
                    "Claim terminated, restarting consumer session"
                );
                self.restart_session().await
            }
        }
    }

    /// Stop every claim and rejoin the group so partitions restart from committed offsets
    async fn restart_session(&mut self) -> Result<(), PipelineError> {
        metrics::counter!(SESSION_RESTARTS).increment(1);
        self.stop_all_claims().await;

        self.consumer.unsubscribe();
        self.consumer.subscribe(&[self.topic.as_str()])?;
        info!(topic = %self.topic, "Re-subscribed after claim termination");
        Ok(())
    }

    fn ensure_claim(&mut self, partition: &Partition, shutdown: &CancellationToken) {
        if !self.claims.contains_key(partition) {
            let claim = self.start_claim(partition.clone(), shutdown);
            self.claims.insert(partition.clone(), claim);
        }
    }

    fn start_claim(&mut self, partition: Partition, shutdown: &CancellationToken) -> RunningClaim {
        self.next_generation += 1;
        let generation = self.next_generation;
        let capacity = self.processor.config().window_capacity;
        let (sender, receiver) = mpsc::channel(capacity);
        let cancel = shutdown.child_token();

        let processor = self.processor.clone();
        let session = Arc::new(KafkaSession::new(self.consumer.clone()));
        let done_tx = self.done_tx.clone();
        let claim_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = processor
                .consume_claim(
                    partition.clone(),
                    session,
                    ReceiverStream::new(receiver),
                    &claim_cancel,
                )
                .await;
            if done_tx
                .send(ClaimDone {
                    partition,
                    generation,
                    result,
                })
                .is_err()
            {
                debug!("Consumer loop gone before claim result was delivered");
            }
        });

        RunningClaim {
            generation,
            sender,
            cancel,
            handle,
        }
    }

    async fn dispatch(&mut self, message: ConsumedMessage, shutdown: &CancellationToken) {
        let partition = message.partition().clone();

        // The assign event for this partition may still be queued behind the message
        if !self.claims.contains_key(&partition) {
            while let Ok(event) = self.events.try_recv() {
                self.handle_event(event, shutdown);
            }
        }
        let Some(claim) = self.claims.get(&partition) else {
            warn!(
                partition = %partition,
                offset = message.offset(),
                "Dropping message for partition without a claim"
            );
            return;
        };
        let sender = claim.sender.clone();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {}
            sent = sender.send(Ok(message)) => {
                if sent.is_err() {
                    // Claim is ending; the message is redelivered after the restart
                    debug!(partition = %partition, "Dropped message for stopped claim");
                }
            }
        }
    }

    async fn stop_all_claims(&mut self) {
        let claims: Vec<(Partition, RunningClaim)> = self.claims.drain().collect();
        for (_, claim) in &claims {
            claim.cancel.cancel();
        }
        for (partition, claim) in claims {
            drop(claim.sender);
            if let Err(e) = claim.handle.await {
                error!(partition = %partition, error = %e, "Claim task failed");
            }
        }
    }
}
