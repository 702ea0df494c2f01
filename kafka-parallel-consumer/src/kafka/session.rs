use std::sync::Arc;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::{Offset, TopicPartitionList};

use crate::kafka::context::ClaimContext;
use crate::kafka::types::Partition;
use crate::pipeline::committer::ClaimSession;

/// Commits claim offsets through the shared group consumer
#[derive(Clone)]
pub struct KafkaSession {
    consumer: Arc<StreamConsumer<ClaimContext>>,
}

impl KafkaSession {
    pub fn new(consumer: Arc<StreamConsumer<ClaimContext>>) -> Self {
        Self { consumer }
    }
}

impl ClaimSession for KafkaSession {
    fn mark_offset(
        &self,
        partition: &Partition,
        offset: i64,
        metadata: Option<&str>,
    ) -> KafkaResult<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
        )?;

        if let Some(metadata) = metadata {
            if let Some(mut elem) =
                list.find_partition(partition.topic(), partition.partition_number())
            {
                elem.set_metadata(metadata);
            }
        }

        self.consumer.commit(&list, CommitMode::Async)
    }
}
