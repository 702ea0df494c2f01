use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kafka::types::Partition;

/// Partition ownership changes, forwarded from librdkafka callbacks to the consumer loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEvent {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
}

pub type ClaimEventReceiver = mpsc::UnboundedReceiver<ClaimEvent>;

pub struct ClaimContext {
    events: mpsc::UnboundedSender<ClaimEvent>,
}

impl ClaimContext {
    pub fn new() -> (Self, ClaimEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn forward(&self, event: ClaimEvent) {
        if let Err(e) = self.events.send(event) {
            error!("Failed to forward claim event, consumer loop is gone: {}", e);
        }
    }
}

fn partitions(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

impl ClientContext for ClaimContext {}

impl ConsumerContext for ClaimContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(list) => {
                if list.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                info!("Revoking {} partitions", list.count());
                // Claims must stop before the partitions change hands
                self.forward(ClaimEvent::Revoked(partitions(list)));
            }
            Rebalance::Assign(list) => {
                debug!("Pre-rebalance assign event for {} partitions", list.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(list) => {
                if list.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }
                info!("Assigned {} partitions", list.count());
                self.forward(ClaimEvent::Assigned(partitions(list)));
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_from_list() {
        let mut list = TopicPartitionList::new();
        list.add_partition("events", 0);
        list.add_partition("events", 3);

        assert_eq!(
            partitions(&list),
            vec![
                Partition::new("events".to_string(), 0),
                Partition::new("events".to_string(), 3),
            ]
        );
    }

    #[tokio::test]
    async fn test_forward_delivers_events() {
        let (context, mut rx) = ClaimContext::new();
        let assigned = vec![Partition::new("events".to_string(), 1)];

        context.forward(ClaimEvent::Assigned(assigned.clone()));

        assert_eq!(rx.recv().await, Some(ClaimEvent::Assigned(assigned)));
    }
}
