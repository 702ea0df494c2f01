use std::time::Duration;

use tracing::warn;

use crate::handler::MessageHandler;
use crate::kafka::types::ConsumedMessage;
use crate::metrics_consts::WORKER_MESSAGE_ERRORS;

/// Exponential backoff around a handler's `perform`, without jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 means the handler is called exactly once.
    pub max_retries: u32,
    /// Growth factor applied to the interval for every further retry
    pub multiplier: f64,
    /// The backoff interval for the first retry.
    pub initial_interval: Duration,
    /// The maximum possible backoff between retries.
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            multiplier: 1.5,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        multiplier: f64,
        initial_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            max_retries,
            multiplier,
            initial_interval,
            max_interval,
        }
    }

    /// Delay before retry number `retry` (1-based): `initial * multiplier^(retry-1)`,
    /// capped at `max_interval`.
    pub fn retry_interval(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let candidate = self.initial_interval.as_nanos() as f64 * self.multiplier.powi(exponent);

        if !candidate.is_finite() || candidate >= self.max_interval.as_nanos() as f64 {
            self.max_interval
        } else {
            Duration::from_nanos(candidate.max(0.0) as u64)
        }
    }

    /// Run `handler.perform` until it succeeds or the retries are used up.
    /// Every failed attempt is counted; the last error is returned on exhaustion.
    pub async fn perform<H>(
        &self,
        handler: &H,
        message: &ConsumedMessage,
        worker_id: usize,
    ) -> anyhow::Result<()>
    where
        H: MessageHandler + ?Sized,
    {
        let mut retry = 0;

        loop {
            let error = match handler.perform(message).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            metrics::counter!(
                WORKER_MESSAGE_ERRORS,
                "topic" => message.topic().to_string(),
                "partition" => message.partition_number().to_string(),
                "worker_id" => worker_id.to_string(),
            )
            .increment(1);

            if retry >= self.max_retries {
                return Err(error);
            }
            retry += 1;

            let delay = self.retry_interval(retry);
            warn!(
                topic = message.topic(),
                partition = message.partition_number(),
                offset = message.offset(),
                worker_id = worker_id,
                retry = retry,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Message processing failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use test_case::test_case;

    use super::*;
    use crate::kafka::types::Partition;
    use crate::test_utils::FlakyHandler;

    fn message() -> ConsumedMessage {
        ConsumedMessage::new_for_test(Partition::new("events".to_string(), 0), 7, Some("k"), "{}")
    }

    #[test_case(1, Duration::from_millis(100) ; "first retry uses the initial interval")]
    #[test_case(2, Duration::from_millis(200) ; "second retry doubles")]
    #[test_case(3, Duration::from_millis(400) ; "third retry doubles again")]
    #[test_case(5, Duration::from_millis(1000) ; "capped at max interval")]
    fn test_retry_interval(retry: u32, expected: Duration) {
        let policy = RetryPolicy::new(
            5,
            2.0,
            Duration::from_millis(100),
            Duration::from_millis(1000),
        );

        assert_eq!(policy.retry_interval(retry), expected);
    }

    #[test]
    fn test_retry_interval_survives_huge_exponents() {
        let policy = RetryPolicy::new(
            u32::MAX,
            10.0,
            Duration::from_secs(1),
            Duration::from_secs(60),
        );

        assert_eq!(policy.retry_interval(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_zero_retries_calls_once() {
        let handler = Arc::new(FlakyHandler::always_failing());
        let policy = RetryPolicy::default();

        let result = policy.perform(handler.as_ref(), &message(), 0).await;

        assert!(result.is_err());
        assert_eq!(handler.attempts(), 1);
    }

    #[tokio::test]
    async fn test_three_retries_make_four_attempts_with_growing_delays() {
        let handler = Arc::new(FlakyHandler::always_failing());
        let policy = RetryPolicy::new(3, 2.0, Duration::from_millis(10), Duration::from_secs(1));

        let result = policy.perform(handler.as_ref(), &message(), 0).await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("attempt 4"), "last error returned: {err}");
        assert_eq!(handler.attempts(), 4);

        let times = handler.attempt_times();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(10));
        assert!(gaps[1] >= Duration::from_millis(20));
        assert!(gaps[2] >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_success_after_failures_stops_retrying() {
        let handler = Arc::new(FlakyHandler::failing_times(2));
        let policy = RetryPolicy::new(5, 1.5, Duration::from_millis(1), Duration::from_millis(5));

        let started = Instant::now();
        let result = policy.perform(handler.as_ref(), &message(), 3).await;

        assert!(result.is_ok());
        assert_eq!(handler.attempts(), 3);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
