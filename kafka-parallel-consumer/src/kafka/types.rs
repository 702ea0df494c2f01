use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// An owned copy of a consumed Kafka message, detached from the consumer's buffers
/// so it can travel through the pipeline's queues.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    partition: Partition,
    offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    /// None when the broker did not attach a timestamp
    pub timestamp: Option<SystemTime>,
}

impl ConsumedMessage {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        timestamp: Option<SystemTime>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            value,
            timestamp,
        }
    }

    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        let timestamp = msg
            .timestamp()
            .to_millis()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms));

        Self {
            partition: Partition::new(msg.topic().to_owned(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|p| p.to_vec()),
            timestamp,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Routing key as raw bytes; an absent key is treated the same as an empty one
    pub fn routing_key(&self) -> &[u8] {
        self.key.as_deref().unwrap_or_default()
    }

    /// Build a message without a broker, for tests and local tooling
    pub fn new_for_test(partition: Partition, offset: i64, key: Option<&str>, value: &str) -> Self {
        Self::new(
            partition,
            offset,
            key.map(|k| k.as_bytes().to_vec()),
            Some(value.as_bytes().to_vec()),
            Some(SystemTime::now()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display() {
        let partition = Partition::new("events".to_string(), 3);
        assert_eq!(partition.to_string(), "events:3");
    }

    #[test]
    fn test_missing_key_routes_as_empty() {
        let partition = Partition::new("events".to_string(), 0);
        let keyed = ConsumedMessage::new_for_test(partition.clone(), 1, Some("user-1"), "{}");
        let unkeyed = ConsumedMessage::new_for_test(partition, 2, None, "{}");

        assert_eq!(keyed.routing_key(), b"user-1");
        assert!(unkeyed.routing_key().is_empty());
        assert_eq!(unkeyed.topic(), "events");
        assert_eq!(unkeyed.partition_number(), 0);
        assert_eq!(unkeyed.offset(), 2);
    }
}
