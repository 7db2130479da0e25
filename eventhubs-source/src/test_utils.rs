//! In-process doubles for the broker and the offset store, shared by unit
//! tests and the integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::broker::BrokerClient;
use crate::error::{BrokerError, OffsetStoreError, SourceError};
use crate::offsets::OffsetStorageReader;
use crate::rebalance::{PartitionSeeker, RebalanceEvent, RebalanceListener};
use crate::types::{OffsetMarker, PartitionKey, RawBatch, RawRecord};

/// Record with deterministic key, value and timestamp derived from its offset.
pub fn record(topic: &str, partition: i32, offset: i64) -> RawRecord {
    RawRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(format!("key-{offset}").into_bytes()),
        value: Some(format!("value-{offset}").into_bytes()),
        timestamp: Some(1_700_000_000_000 + offset),
    }
}

pub fn batch(topic: &str, partition: i32, offsets: &[i64]) -> RawBatch {
    RawBatch::new(
        offsets
            .iter()
            .map(|offset| record(topic, partition, *offset))
            .collect(),
    )
}

enum ScriptedPoll {
    Batch(RawBatch),
    Fail(BrokerError),
    // Ignores the poll timeout, like a broker call stuck on the network
    BlockUntilClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekCall {
    Offset(PartitionKey, OffsetMarker),
    Beginning(Vec<PartitionKey>),
    End(Vec<PartitionKey>),
}

/// Seeker that remembers every call, in order.
#[derive(Default)]
pub struct RecordingSeeker {
    calls: Mutex<Vec<SeekCall>>,
}

impl RecordingSeeker {
    pub fn calls(&self) -> Vec<SeekCall> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: SeekCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PartitionSeeker for RecordingSeeker {
    fn seek(&self, partition: &PartitionKey, offset: OffsetMarker) -> Result<(), BrokerError> {
        self.push(SeekCall::Offset(partition.clone(), offset));
        Ok(())
    }

    fn seek_to_beginning(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        self.push(SeekCall::Beginning(partitions.to_vec()));
        Ok(())
    }

    fn seek_to_end(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        self.push(SeekCall::End(partitions.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct ClientStats {
    subscriptions: AtomicUsize,
    polls: AtomicUsize,
    close_calls: AtomicUsize,
    close_timeouts: Mutex<Vec<Duration>>,
}

impl ClientStats {
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Budget passed to each `close`, in call order.
    pub fn close_timeouts(&self) -> Vec<Duration> {
        self.close_timeouts.lock().unwrap().clone()
    }
}

/// Broker client that replays a script of poll results. Once the script is
/// exhausted every poll waits out its timeout and returns an empty batch.
/// `close` unblocks a waiting poll, which then reports [`BrokerError::Closed`].
pub struct ScriptedBrokerClient {
    script: Mutex<VecDeque<ScriptedPoll>>,
    assignment: Mutex<Option<Vec<PartitionKey>>>,
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
    seeker: Arc<RecordingSeeker>,
    stats: Arc<ClientStats>,
    close_signal: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
}

impl ScriptedBrokerClient {
    pub fn new() -> Self {
        let (close_signal, closed) = crossbeam_channel::bounded(0);
        Self {
            script: Mutex::new(VecDeque::new()),
            assignment: Mutex::new(None),
            listener: Mutex::new(None),
            seeker: Arc::new(RecordingSeeker::default()),
            stats: Arc::new(ClientStats::default()),
            close_signal: Mutex::new(Some(close_signal)),
            closed,
        }
    }

    pub fn with_batch(self, batch: RawBatch) -> Self {
        self.push(ScriptedPoll::Batch(batch))
    }

    pub fn with_batches(self, batches: impl IntoIterator<Item = RawBatch>) -> Self {
        batches.into_iter().fold(self, Self::with_batch)
    }

    pub fn with_failure(self, error: BrokerError) -> Self {
        self.push(ScriptedPoll::Fail(error))
    }

    pub fn with_blocking_poll(self) -> Self {
        self.push(ScriptedPoll::BlockUntilClosed)
    }

    /// Deliver an assignment to the installed listener on the first poll.
    pub fn with_assignment(self, partitions: Vec<PartitionKey>) -> Self {
        *self.assignment.lock().unwrap() = Some(partitions);
        self
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        self.stats.clone()
    }

    pub fn seeker(&self) -> Arc<RecordingSeeker> {
        self.seeker.clone()
    }

    fn push(self, poll: ScriptedPoll) -> Self {
        self.script.lock().unwrap().push_back(poll);
        self
    }

    fn is_closed(&self) -> bool {
        matches!(self.closed.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn wait_for_close(&self, timeout: Option<Duration>) -> Result<RawBatch, BrokerError> {
        let waited = match timeout {
            Some(timeout) => self.closed.recv_timeout(timeout),
            None => self
                .closed
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match waited {
            Err(RecvTimeoutError::Timeout) => Ok(RawBatch::default()),
            _ => Err(BrokerError::Closed),
        }
    }

    fn deliver_assignment(&self) -> Result<(), BrokerError> {
        let Some(partitions) = self.assignment.lock().unwrap().take() else {
            return Ok(());
        };
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener
                .on_rebalance(RebalanceEvent::Assigned(&partitions), self.seeker.as_ref())
                .map_err(|e| BrokerError::Rebalance(Box::new(e)))?;
        }
        Ok(())
    }
}

impl Default for ScriptedBrokerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for ScriptedBrokerClient {
    fn subscribe(
        &self,
        _topic: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError> {
        let mut installed = self.listener.lock().unwrap();
        if installed.is_some() {
            return Err(BrokerError::AlreadySubscribed);
        }
        *installed = Some(listener);
        self.stats.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<RawBatch, BrokerError> {
        self.stats.polls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        self.deliver_assignment()?;

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ScriptedPoll::Batch(batch)) => Ok(batch),
            Some(ScriptedPoll::Fail(e)) => Err(e),
            Some(ScriptedPoll::BlockUntilClosed) => self.wait_for_close(None),
            None => self.wait_for_close(Some(timeout)),
        }
    }

    fn close(&self, timeout: Duration) {
        self.stats.close_calls.fetch_add(1, Ordering::SeqCst);
        self.stats.close_timeouts.lock().unwrap().push(timeout);
        self.close_signal.lock().unwrap().take();
    }
}

pub struct NoopRebalanceListener;

impl RebalanceListener for NoopRebalanceListener {
    fn on_rebalance(
        &self,
        _event: RebalanceEvent<'_>,
        _seeker: &dyn PartitionSeeker,
    ) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Offset store backed by a map, standing in for the framework's store.
#[derive(Default)]
pub struct InMemoryOffsetReader {
    offsets: HashMap<PartitionKey, OffsetMarker>,
}

impl InMemoryOffsetReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset(mut self, topic: &str, partition: i32, offset: i64) -> Self {
        if let Ok(marker) = OffsetMarker::new(offset) {
            self.offsets.insert(PartitionKey::new(topic, partition), marker);
        }
        self
    }
}

impl OffsetStorageReader for InMemoryOffsetReader {
    fn read(&self, partition: &PartitionKey) -> Result<Option<OffsetMarker>, OffsetStoreError> {
        Ok(self.offsets.get(partition).copied())
    }
}
