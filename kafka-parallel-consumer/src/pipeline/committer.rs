//! Commit Scheduler - periodic ordered commits and stall detection
//!
//! Two tickers share one task. The commit ticker marks `commit_safe + 1` on the
//! claim session whenever the watermark has moved past the last commit. The
//! give-up ticker raises a terminal signal once, when work is pending and no
//! commit has happened within the give-up threshold.

use std::sync::Arc;
use std::time::Duration;

use rdkafka::error::KafkaResult;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::handler::GiveUpHandler;
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    COMMIT_GIVE_UPS, LAST_COMMITTED_OFFSET, OFFSETS_COMMITTED, OFFSET_COMMIT_FAILURES,
    WINDOW_PENDING, WINDOW_WATERMARK, WINDOW_WRITE_CURSOR,
};
use crate::pipeline::offset_window::WindowView;

/// Broker session as seen by one claim. `offset` is the next offset to read,
/// i.e. one past the last processed message.
pub trait ClaimSession: Send + Sync {
    fn mark_offset(
        &self,
        partition: &Partition,
        offset: i64,
        metadata: Option<&str>,
    ) -> KafkaResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct CommitSchedule {
    pub commit_interval: Duration,
    pub give_up_check_interval: Duration,
    pub give_up_after: Duration,
}

pub struct CommitScheduler {
    partition: Partition,
    window: WindowView,
    session: Arc<dyn ClaimSession>,
    give_up_handler: Arc<dyn GiveUpHandler>,
    schedule: CommitSchedule,
    give_up_tx: mpsc::Sender<PipelineError>,
    latest_committed_offset: Option<i64>,
    latest_commit_time: Instant,
    gave_up: bool,
}

impl CommitScheduler {
    pub fn new(
        partition: Partition,
        window: WindowView,
        session: Arc<dyn ClaimSession>,
        give_up_handler: Arc<dyn GiveUpHandler>,
        schedule: CommitSchedule,
        give_up_tx: mpsc::Sender<PipelineError>,
    ) -> Self {
        Self {
            partition,
            window,
            session,
            give_up_handler,
            schedule,
            give_up_tx,
            latest_committed_offset: None,
            latest_commit_time: Instant::now(),
            gave_up: false,
        }
    }

    pub fn latest_committed_offset(&self) -> Option<i64> {
        self.latest_committed_offset
    }

    /// Commit the watermark if it moved. Returns the offset marked on the session.
    pub fn commit(&mut self) -> Option<i64> {
        let topic = self.partition.topic().to_string();
        let partition = self.partition.partition_number().to_string();

        metrics::gauge!(WINDOW_WATERMARK, "topic" => topic.clone(), "partition" => partition.clone())
            .set(self.window.read_cursor() as f64);
        metrics::gauge!(WINDOW_WRITE_CURSOR, "topic" => topic.clone(), "partition" => partition.clone())
            .set(self.window.write_cursor() as f64);
        let pending = self.window.pending_count();
        metrics::gauge!(WINDOW_PENDING, "topic" => topic.clone(), "partition" => partition.clone())
            .set(pending as f64);

        if pending == 0 {
            // Idle is not a stall, start the clock when work arrives
            self.latest_commit_time = Instant::now();
        }

        let safe = self.window.commit_safe_offset()?;
        if self.latest_committed_offset.is_some_and(|latest| safe <= latest) {
            return None;
        }

        let next_offset = safe + 1;
        match self.session.mark_offset(&self.partition, next_offset, None) {
            Ok(()) => {
                self.latest_committed_offset = Some(safe);
                self.latest_commit_time = Instant::now();
                metrics::counter!(OFFSETS_COMMITTED, "topic" => topic.clone(), "partition" => partition.clone())
                    .increment(1);
                metrics::gauge!(LAST_COMMITTED_OFFSET, "topic" => topic, "partition" => partition)
                    .set(next_offset as f64);
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    offset = next_offset,
                    "Marked offset"
                );
                Some(next_offset)
            }
            Err(e) => {
                metrics::counter!(OFFSET_COMMIT_FAILURES, "topic" => topic, "partition" => partition)
                    .increment(1);
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    offset = next_offset,
                    error = %e,
                    "Failed to mark offset, will retry on next tick"
                );
                None
            }
        }
    }

    /// True when work is pending and nothing was committed within the threshold
    pub fn is_stalled(&self) -> bool {
        self.latest_commit_time.elapsed() > self.schedule.give_up_after
            && self.window.pending_count() > 0
    }

    /// Fire the give-up handler and signal once per pipeline. The send is
    /// abandoned if `cancel` fires first.
    pub async fn check_give_up(&mut self, cancel: &CancellationToken) {
        if self.gave_up || !self.is_stalled() {
            return;
        }
        self.gave_up = true;

        let waited = self.latest_commit_time.elapsed();
        error!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            pending = self.window.pending_count(),
            waited_ms = waited.as_millis() as u64,
            "Commit give up: watermark has not moved"
        );
        metrics::counter!(
            COMMIT_GIVE_UPS,
            "topic" => self.partition.topic().to_string(),
            "partition" => self.partition.partition_number().to_string(),
        )
        .increment(1);

        self.give_up_handler
            .handle_commit_give_up(self.partition.topic(), self.partition.partition_number());

        let signal = PipelineError::CommitGiveUp {
            topic: self.partition.topic().to_string(),
            partition: self.partition.partition_number(),
            waited_ms: waited.as_millis(),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    "Cancelled before give up signal was delivered"
                );
            }
            sent = self.give_up_tx.send(signal) => {
                if sent.is_err() {
                    debug!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        "Give up receiver already gone"
                    );
                }
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut commit_ticker = tokio::time::interval(self.schedule.commit_interval);
        commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut give_up_ticker = tokio::time::interval(self.schedule.give_up_check_interval);
        give_up_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the immediate first ticks
        commit_ticker.tick().await;
        give_up_ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        last_committed = ?self.latest_committed_offset,
                        "Commit scheduler stopped"
                    );
                    return;
                }
                _ = commit_ticker.tick() => {
                    self.commit();
                }
                _ = give_up_ticker.tick() => {
                    self.check_give_up(&cancel).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::offset_window::OffsetWindow;
    use crate::test_utils::{test_partition, CountingGiveUpHandler, RecordingSession};

    fn schedule(give_up_after: Duration) -> CommitSchedule {
        CommitSchedule {
            commit_interval: Duration::from_millis(10),
            give_up_check_interval: Duration::from_millis(10),
            give_up_after,
        }
    }

    #[tokio::test]
    async fn test_commit_marks_watermark_plus_one_once() {
        let mut window = OffsetWindow::new(4, Duration::from_millis(5)).unwrap();
        let view = window.view();
        let cancel = CancellationToken::new();
        let session = Arc::new(RecordingSession::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut scheduler = CommitScheduler::new(
            test_partition(),
            view.clone(),
            session.clone(),
            Arc::new(CountingGiveUpHandler::new()),
            schedule(Duration::from_secs(60)),
            tx,
        );

        assert_eq!(scheduler.commit(), None);

        window.admit(40, &cancel).await.unwrap().mark_complete();
        window.admit(41, &cancel).await.unwrap().mark_complete();
        view.scan();

        assert_eq!(scheduler.commit(), Some(42));
        assert_eq!(scheduler.commit(), None);
        assert_eq!(scheduler.latest_committed_offset(), Some(41));

        let marks = session.marks();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].0, test_partition());
        assert_eq!(marks[0].1, 42);
        assert_eq!(marks[0].2, None);
    }

    #[tokio::test]
    async fn test_failed_mark_leaves_state_for_next_tick() {
        let mut window = OffsetWindow::new(4, Duration::from_millis(5)).unwrap();
        let view = window.view();
        let cancel = CancellationToken::new();
        let session = Arc::new(RecordingSession::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut scheduler = CommitScheduler::new(
            test_partition(),
            view.clone(),
            session.clone(),
            Arc::new(CountingGiveUpHandler::new()),
            schedule(Duration::from_secs(60)),
            tx,
        );

        window.admit(0, &cancel).await.unwrap().mark_complete();
        view.scan();

        session.set_rejecting(true);
        assert_eq!(scheduler.commit(), None);
        assert_eq!(scheduler.latest_committed_offset(), None);

        session.set_rejecting(false);
        assert_eq!(scheduler.commit(), Some(1));
        assert_eq!(session.marked_offsets(), vec![1]);
    }

    #[tokio::test]
    async fn test_give_up_fires_once_for_stuck_slot() {
        let mut window = OffsetWindow::new(4, Duration::from_millis(5)).unwrap();
        let view = window.view();
        let cancel = CancellationToken::new();
        let give_up = Arc::new(CountingGiveUpHandler::new());
        let (tx, mut rx) = mpsc::channel(1);
        let scheduler = CommitScheduler::new(
            test_partition(),
            view,
            Arc::new(RecordingSession::new()),
            give_up.clone(),
            schedule(Duration::from_millis(40)),
            tx,
        );

        let _stuck = window.admit(0, &cancel).await.unwrap();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        let signal = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("give up signal should arrive")
            .unwrap();
        assert!(signal.is_commit_give_up());

        // Several more check ticks pass without a second signal
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(give_up.calls(), vec![("test-topic".to_string(), 0)]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_give_up_without_pending_messages() {
        let window = OffsetWindow::new(4, Duration::from_millis(5)).unwrap();
        let cancel = CancellationToken::new();
        let give_up = Arc::new(CountingGiveUpHandler::new());
        let (tx, mut rx) = mpsc::channel(1);
        let scheduler = CommitScheduler::new(
            test_partition(),
            window.view(),
            Arc::new(RecordingSession::new()),
            give_up.clone(),
            schedule(Duration::from_millis(20)),
            tx,
        );

        let task = tokio::spawn(scheduler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(rx.try_recv().is_err());
        assert!(give_up.calls().is_empty());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_give_up_send_abandoned_when_cancelled() {
        let mut window = OffsetWindow::new(4, Duration::from_millis(5)).unwrap();
        let cancel = CancellationToken::new();
        // Full channel, nobody receiving
        let (tx, _rx) = mpsc::channel(1);
        tx.send(PipelineError::TaskFailed("occupied".to_string()))
            .await
            .unwrap();
        let mut scheduler = CommitScheduler::new(
            test_partition(),
            window.view(),
            Arc::new(RecordingSession::new()),
            Arc::new(CountingGiveUpHandler::new()),
            schedule(Duration::from_millis(1)),
            tx,
        );

        let _stuck = window.admit(0, &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        tokio::time::timeout(Duration::from_secs(1), scheduler.check_give_up(&cancel))
            .await
            .expect("check_give_up must return after cancellation");
    }
}
