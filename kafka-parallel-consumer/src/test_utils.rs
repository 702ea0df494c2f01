//! Test doubles shared by unit and integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};

use crate::handler::{GiveUpHandler, MessageHandler};
use crate::kafka::types::{ConsumedMessage, Partition};
use crate::pipeline::committer::ClaimSession;

/// Handler that fails a fixed number of times before succeeding, recording each attempt.
pub struct FlakyHandler {
    failures_before_success: usize,
    attempts: AtomicUsize,
    attempt_times: Mutex<Vec<Instant>>,
}

impl FlakyHandler {
    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures_before_success: failures,
            attempts: AtomicUsize::new(0),
            attempt_times: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_times(usize::MAX)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn perform(&self, _message: &ConsumedMessage) -> anyhow::Result<()> {
        self.attempt_times.lock().unwrap().push(Instant::now());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.failures_before_success {
            Ok(())
        } else {
            Err(anyhow!("attempt {attempt} failed"))
        }
    }

    async fn fallback(&self, _message: &ConsumedMessage, _error: &anyhow::Error) {}
}

/// Handler that records processed offsets, optionally delaying or failing specific ones.
#[derive(Default)]
pub struct RecordingHandler {
    delays: Vec<(i64, Duration)>,
    failing: HashSet<i64>,
    processed: Mutex<Vec<i64>>,
    fallbacks: Mutex<Vec<i64>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, offset: i64, delay: Duration) -> Self {
        self.delays.push((offset, delay));
        self
    }

    pub fn with_failure(mut self, offset: i64) -> Self {
        self.failing.insert(offset);
        self
    }

    pub fn processed(&self) -> Vec<i64> {
        self.processed.lock().unwrap().clone()
    }

    pub fn fallbacks(&self) -> Vec<i64> {
        self.fallbacks.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn perform(&self, message: &ConsumedMessage) -> anyhow::Result<()> {
        let offset = message.offset();
        if let Some((_, delay)) = self.delays.iter().find(|(o, _)| *o == offset) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&offset) {
            return Err(anyhow!("offset {offset} is poisoned"));
        }
        self.processed.lock().unwrap().push(offset);
        Ok(())
    }

    async fn fallback(&self, message: &ConsumedMessage, _error: &anyhow::Error) {
        self.fallbacks.lock().unwrap().push(message.offset());
    }
}

/// Session that records every marked offset, and can be told to reject marks.
#[derive(Default)]
pub struct RecordingSession {
    marks: Mutex<Vec<(Partition, i64, Option<String>)>>,
    reject: AtomicBool,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Offsets marked so far, in call order
    pub fn marked_offsets(&self) -> Vec<i64> {
        self.marks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, offset, _)| *offset)
            .collect()
    }

    pub fn marks(&self) -> Vec<(Partition, i64, Option<String>)> {
        self.marks.lock().unwrap().clone()
    }
}

impl ClaimSession for RecordingSession {
    fn mark_offset(
        &self,
        partition: &Partition,
        offset: i64,
        metadata: Option<&str>,
    ) -> KafkaResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::CoordinatorNotAvailable,
            ));
        }
        self.marks.lock().unwrap().push((
            partition.clone(),
            offset,
            metadata.map(str::to_string),
        ));
        Ok(())
    }
}

/// Give-up handler that counts invocations
#[derive(Default)]
pub struct CountingGiveUpHandler {
    calls: Mutex<Vec<(String, i32)>>,
}

impl CountingGiveUpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, i32)> {
        self.calls.lock().unwrap().clone()
    }
}

impl GiveUpHandler for CountingGiveUpHandler {
    fn handle_commit_give_up(&self, topic: &str, partition: i32) {
        self.calls
            .lock()
            .unwrap()
            .push((topic.to_string(), partition));
    }
}

pub fn test_partition() -> Partition {
    Partition::new("test-topic".to_string(), 0)
}

/// Messages for consecutive offsets, keyed `key-{offset}`
pub fn messages(partition: &Partition, offsets: std::ops::Range<i64>) -> Vec<ConsumedMessage> {
    offsets
        .map(|offset| {
            ConsumedMessage::new_for_test(
                partition.clone(),
                offset,
                Some(&format!("key-{offset}")),
                "{}",
            )
        })
        .collect()
}
