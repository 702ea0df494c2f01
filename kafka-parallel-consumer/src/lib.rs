//! Kafka parallel consumer.
//!
//! Processes each assigned partition with several concurrent workers while
//! committing offsets strictly in order: an offset is committed only once it
//! and every offset before it have been handled (at-least-once delivery).
//!
//! ## Error logging (anyhow)
//!
//! Handler errors are `anyhow::Error`. Log them with `error = ?e` so the full
//! cause chain is visible; `%e` only shows the top-level message.

pub mod config;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod pipeline;
pub mod test_utils;
