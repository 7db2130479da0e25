use std::sync::Arc;
use std::time::Duration;

use crate::error::BrokerError;
use crate::rebalance::RebalanceListener;
use crate::types::RawBatch;

/// The blocking broker client driven by the polling thread.
///
/// Only the polling thread calls `subscribe` and `poll`; rebalance callbacks
/// run inside `poll` on that same thread. `close` is the one operation called
/// from another thread, and it must unblock a concurrent `poll`.
pub trait BrokerClient: Send + Sync + 'static {
    /// Subscribe to `topic`, installing `listener` for partition ownership changes.
    fn subscribe(&self, topic: &str, listener: Arc<dyn RebalanceListener>)
        -> Result<(), BrokerError>;

    /// Wait up to `timeout` for records. An empty batch means nothing arrived in time.
    /// [`BrokerError::Transient`] means the client expects to recover and the
    /// caller should back off and poll again.
    fn poll(&self, timeout: Duration) -> Result<RawBatch, BrokerError>;

    /// Release the client within `timeout`. Must be idempotent.
    fn close(&self, timeout: Duration);
}
