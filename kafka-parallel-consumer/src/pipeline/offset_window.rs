//! Offset Window - fixed-capacity ring of in-flight messages
//!
//! Tracks which admitted offsets have been handled and derives the highest
//! offset that is safe to commit: the last offset of the longest prefix of
//! completed slots. Workers may finish in any order; the watermark (read
//! cursor) only ever advances over a contiguous run of completed slots.
//!
//! Access is lock-free. One task admits (the orchestrator), one task scans,
//! and any number of workers flip completion flags through their `Slot` handle.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ConfigError;

const NO_OFFSET: i64 = -1;

struct SlotCell {
    offset: AtomicI64,
    completed: AtomicBool,
}

struct WindowState {
    slots: Box<[SlotCell]>,
    write_cursor: AtomicU64,
    read_cursor: AtomicU64,
    last_confirmed_offset: AtomicI64,
}

impl WindowState {
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn cell(&self, sequence: u64) -> &SlotCell {
        &self.slots[(sequence % self.capacity()) as usize]
    }
}

/// The admitting side of the window. Only one exists per pipeline, so admission
/// is single-writer by construction.
pub struct OffsetWindow {
    state: Arc<WindowState>,
    backpressure_interval: Duration,
}

impl OffsetWindow {
    pub fn new(capacity: usize, backpressure_interval: Duration) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        let slots = (0..capacity)
            .map(|_| SlotCell {
                offset: AtomicI64::new(NO_OFFSET),
                completed: AtomicBool::new(false),
            })
            .collect();

        Ok(Self {
            state: Arc::new(WindowState {
                slots,
                write_cursor: AtomicU64::new(0),
                read_cursor: AtomicU64::new(0),
                last_confirmed_offset: AtomicI64::new(NO_OFFSET),
            }),
            backpressure_interval,
        })
    }

    /// Shared read/scan access for the committer and the scanner task
    pub fn view(&self) -> WindowView {
        WindowView {
            state: self.state.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.slots.len()
    }

    /// Reserve a slot for `offset`, waiting while the window is full.
    ///
    /// Returns `None` if `cancel` fires before a slot frees up.
    pub async fn admit(&mut self, offset: i64, cancel: &CancellationToken) -> Option<Slot> {
        let state = &self.state;
        // Only this handle writes the cursor
        let write = state.write_cursor.load(Ordering::Relaxed);

        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let read = state.read_cursor.load(Ordering::Acquire);
            if write - read < state.capacity() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.backpressure_interval) => {}
            }
        }

        let cell = state.cell(write);
        cell.offset.store(offset, Ordering::Relaxed);
        cell.completed.store(false, Ordering::Relaxed);
        state.write_cursor.store(write + 1, Ordering::Release);

        Some(Slot {
            state: self.state.clone(),
            sequence: write,
            offset,
        })
    }
}

/// Handle to one admitted message. Completing consumes the handle, so a slot
/// flips to completed at most once; dropping it leaves the slot unconfirmed.
pub struct Slot {
    state: Arc<WindowState>,
    sequence: u64,
    offset: i64,
}

impl Slot {
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn mark_complete(self) {
        self.state
            .cell(self.sequence)
            .completed
            .store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("sequence", &self.sequence)
            .field("offset", &self.offset)
            .finish()
    }
}

#[derive(Clone)]
pub struct WindowView {
    state: Arc<WindowState>,
}

impl WindowView {
    /// Highest offset with every earlier admitted offset confirmed, as of the last scan
    pub fn commit_safe_offset(&self) -> Option<i64> {
        match self.state.last_confirmed_offset.load(Ordering::Acquire) {
            NO_OFFSET => None,
            offset => Some(offset),
        }
    }

    /// Admitted messages not yet passed by the watermark
    pub fn pending_count(&self) -> u64 {
        let read = self.state.read_cursor.load(Ordering::Acquire);
        let write = self.state.write_cursor.load(Ordering::Acquire);
        write.saturating_sub(read)
    }

    pub fn capacity(&self) -> usize {
        self.state.slots.len()
    }

    pub fn write_cursor(&self) -> u64 {
        self.state.write_cursor.load(Ordering::Acquire)
    }

    pub fn read_cursor(&self) -> u64 {
        self.state.read_cursor.load(Ordering::Acquire)
    }

    /// Advance the watermark over completed slots, stopping at the first
    /// incomplete one. Returns how many slots were confirmed.
    pub fn scan(&self) -> u64 {
        let state = &self.state;
        let mut confirmed = 0;

        loop {
            let read = state.read_cursor.load(Ordering::Acquire);
            let write = state.write_cursor.load(Ordering::Acquire);
            if read >= write {
                break;
            }

            let cell = state.cell(read);
            if !cell.completed.load(Ordering::Acquire) {
                break;
            }
            let offset = cell.offset.load(Ordering::Relaxed);

            // Publish the offset before releasing the cell to the writer
            state
                .last_confirmed_offset
                .fetch_max(offset, Ordering::AcqRel);
            if state
                .read_cursor
                .compare_exchange(read, read + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                confirmed += 1;
            }
        }

        confirmed
    }

    /// Scan on a fixed interval until cancelled
    pub async fn run_scanner(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Watermark scanner stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.scan();
                }
            }
        }
    }
}
