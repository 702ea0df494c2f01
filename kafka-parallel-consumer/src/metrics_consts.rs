// ==== Offset window metrics ====
/// Gauge for the configured window capacity per partition
pub const WINDOW_CAPACITY: &str = "parallel_consumer_window_capacity";

/// Gauge for the watermark (read cursor) of the window
pub const WINDOW_WATERMARK: &str = "parallel_consumer_window_watermark";

/// Gauge for the write cursor of the window
pub const WINDOW_WRITE_CURSOR: &str = "parallel_consumer_window_write_cursor";

/// Gauge for admitted but not yet confirmed messages
pub const WINDOW_PENDING: &str = "parallel_consumer_window_pending";

/// Histogram for time spent waiting for a free slot (ms)
pub const WINDOW_ADMIT_WAIT_MS: &str = "parallel_consumer_window_admit_wait_ms";

// ==== Worker metrics ====
/// Gauge for the number of workers per partition pipeline
pub const WORKER_COUNT: &str = "parallel_consumer_worker_count";

/// Gauge for messages a worker is currently handling
pub const WORKER_MESSAGES_IN_PROGRESS: &str = "parallel_consumer_worker_messages_in_progress";

/// Counter for messages handled successfully
pub const WORKER_MESSAGES_PROCESSED: &str = "parallel_consumer_worker_messages_processed_total";

/// Counter for failed processing attempts, incremented once per attempt
pub const WORKER_MESSAGE_ERRORS: &str = "parallel_consumer_worker_message_errors_total";

/// Counter for messages handed to the fallback after retries ran out
pub const WORKER_FALLBACKS: &str = "parallel_consumer_worker_fallbacks_total";

/// Histogram for per-message processing time including retries (ms)
pub const WORKER_PROCESSING_DURATION_MS: &str = "parallel_consumer_worker_processing_duration_ms";

// ==== Commit metrics ====
/// Counter for offsets marked on the broker session
pub const OFFSETS_COMMITTED: &str = "parallel_consumer_offsets_committed_total";

/// Counter for failed offset commits
pub const OFFSET_COMMIT_FAILURES: &str = "parallel_consumer_offset_commit_failures_total";

/// Gauge for the last committed offset (next offset to read)
pub const LAST_COMMITTED_OFFSET: &str = "parallel_consumer_last_committed_offset";

/// Counter for give-up events raised by the stall detector
pub const COMMIT_GIVE_UPS: &str = "parallel_consumer_commit_give_ups_total";

// ==== Consumer metrics ====
/// Gauge for partition claims currently running
pub const CLAIMS_ACTIVE: &str = "parallel_consumer_claims_active";

/// Counter for claims that ended with an error, labelled by reason
pub const CLAIMS_TERMINATED: &str = "parallel_consumer_claims_terminated_total";

/// Counter for session restarts triggered by a failed claim
pub const SESSION_RESTARTS: &str = "parallel_consumer_session_restarts_total";

/// Counter for broker errors seen on the consumer stream
pub const KAFKA_RECV_ERRORS: &str = "parallel_consumer_kafka_recv_errors_total";
