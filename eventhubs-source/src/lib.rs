//! Kafka-protocol source for Azure EventHubs.
//!
//! A single background thread polls the broker and hands batches to a
//! bounded queue; the caller drains that queue through
//! [`task::EventHubsSourceTask`]. When partitions are assigned, each one is
//! positioned from the externally stored offset, or from the configured
//! earliest/latest boundary when nothing was stored.
//!
//! ## Error logging
//!
//! Log errors as a structured field (`error = ?e`) so the whole `source()`
//! chain is visible, not only the top-level message.

pub mod broker;
pub mod config;
pub mod controller;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod offsets;
pub mod producer;
pub mod rebalance;
pub mod task;
pub mod test_utils;
pub mod types;

pub use error::SourceError;
pub use task::EventHubsSourceTask;
