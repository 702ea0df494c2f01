use rdkafka::error::KafkaError;
use thiserror::Error;

/// Invalid construction parameters. Raised before any pipeline starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("window capacity must be greater than 0")]
    ZeroCapacity,

    #[error("worker count must be greater than 0")]
    ZeroWorkers,

    #[error("unknown routing mode: {0} (expected key_distribute or round_robin)")]
    UnknownRoutingMode(String),

    #[error("retry multiplier must be a finite number greater than 0, got {0}")]
    InvalidRetryMultiplier(f64),

    #[error("{name} must be greater than 0")]
    ZeroInterval { name: &'static str },

    #[error("retry max interval must not be shorter than the initial interval")]
    RetryIntervalsInverted,
}

/// Reasons a partition claim stops with an error. Every variant tells the
/// consumer to let the partition be rebalanced rather than keep feeding it.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("commit give up for {topic}:{partition}: no commit progress within {waited_ms}ms while messages are pending")]
    CommitGiveUp {
        topic: String,
        partition: i32,
        waited_ms: u128,
    },

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    pub fn is_commit_give_up(&self) -> bool {
        matches!(self, PipelineError::CommitGiveUp { .. })
    }
}
