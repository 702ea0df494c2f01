use async_trait::async_trait;
use tracing::warn;

use crate::kafka::types::ConsumedMessage;

/// User business logic plugged into every partition pipeline.
///
/// `perform` is called through the retry wrapper; once retries run out the
/// message is handed to `fallback` and its offset is never confirmed, so the
/// partition stalls until the give-up detector ends the claim.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn perform(&self, message: &ConsumedMessage) -> anyhow::Result<()>;

    async fn fallback(&self, message: &ConsumedMessage, error: &anyhow::Error);
}

/// Notified when a partition's commits have stalled for longer than the give-up threshold.
pub trait GiveUpHandler: Send + Sync {
    fn handle_commit_give_up(&self, topic: &str, partition: i32);
}

/// Default give-up handler, only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingGiveUpHandler;

impl GiveUpHandler for LoggingGiveUpHandler {
    fn handle_commit_give_up(&self, topic: &str, partition: i32) {
        warn!(
            topic = topic,
            partition = partition,
            "Giving up on partition, commits made no progress while messages are pending"
        );
    }
}
