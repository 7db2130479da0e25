use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::error::{BrokerError, SourceError};
use crate::metrics_consts::{
    BATCHES_DROPPED_COUNTER, BATCHES_POLLED_COUNTER, BATCH_SIZE_HISTOGRAM,
    POLLING_THREAD_EXITS_COUNTER, QUEUE_OFFER_RETRIES_COUNTER, RECORDS_POLLED_COUNTER,
};
use crate::rebalance::RebalanceListener;
use crate::types::RawBatch;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_secs(5);

// Backoff after the n-th consecutive recoverable poll error is n steps, capped
const TRANSIENT_BACKOFF_STEP: Duration = Duration::from_millis(100);
const MAX_BACKOFF_STEPS: u32 = 10;

type PollingThread = JoinHandle<Result<(), SourceError>>;
type ThreadBody = Box<dyn FnOnce() -> Result<(), SourceError> + Send + 'static>;

enum State {
    NotStarted,
    Running {
        // Dropping the sender is the cancellation signal
        cancel: Sender<()>,
        // Disconnects when the thread body returns or unwinds
        exited: Receiver<()>,
        handle: PollingThread,
    },
    // The thread exited on its own and was joined; the client is still open
    Finished,
    Stopped,
}

enum Offer {
    Delivered,
    Interrupted(RawBatch),
    Disconnected,
}

/// Owns the broker client and the single background thread that polls it,
/// handing every non-empty batch to the bounded queue.
///
/// The thread's outcome is kept in its `JoinHandle`: a broker failure ends
/// the thread with an error, which dropping the queue sender makes visible
/// to the reading side.
pub struct QueuedProducer<C: BrokerClient> {
    client: Arc<C>,
    listener: Arc<dyn RebalanceListener>,
    queue: Option<Sender<RawBatch>>,
    topic: String,
    client_id: String,
    poll_timeout: Duration,
    offer_timeout: Duration,
    state: State,
}

impl<C: BrokerClient> QueuedProducer<C> {
    pub fn new(
        client: C,
        listener: Arc<dyn RebalanceListener>,
        queue: Sender<RawBatch>,
        topic: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            client: Arc::new(client),
            listener,
            queue: Some(queue),
            topic: topic.into(),
            client_id: client_id.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
            state: State::NotStarted,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Spawn the polling thread. Calling it again once started does nothing.
    /// If the thread cannot be spawned the producer stays startable.
    pub fn start(&mut self) -> Result<(), SourceError> {
        self.start_with(|name, body| thread::Builder::new().name(name).spawn(body))
    }

    fn start_with<S>(&mut self, spawn: S) -> Result<(), SourceError>
    where
        S: FnOnce(String, ThreadBody) -> io::Result<PollingThread>,
    {
        if !matches!(self.state, State::NotStarted) {
            debug!(client_id = %self.client_id, "Polling thread already started");
            return Ok(());
        }
        let Some(queue) = self.queue.clone() else {
            return Ok(());
        };

        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
        let worker = PollingLoop {
            client: self.client.clone(),
            listener: self.listener.clone(),
            queue,
            cancelled,
            topic: self.topic.clone(),
            poll_timeout: self.poll_timeout,
            offer_timeout: self.offer_timeout,
        };

        let (exited_tx, exited) = crossbeam_channel::bounded::<()>(0);
        let body: ThreadBody = Box::new(move || {
            let outcome = worker.run();
            drop(exited_tx);
            outcome
        });

        let handle = spawn(format!("eventhubs-poll-{}", self.client_id), body).map_err(|e| {
            error!(client_id = %self.client_id, error = ?e, "Failed to spawn polling thread");
            SourceError::Spawn(e)
        })?;

        // The worker owns its clone of the sender from here on
        self.queue = None;
        info!(client_id = %self.client_id, topic = %self.topic, "Started polling thread");
        self.state = State::Running {
            cancel,
            exited,
            handle,
        };
        Ok(())
    }

    /// Wait up to `timeout` for a polling thread that is already on its way
    /// out, and collect its outcome. `None` while it is still running or when
    /// there is nothing to collect.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Option<Result<(), SourceError>> {
        let State::Running { exited, .. } = &self.state else {
            return None;
        };
        if !wait_until_finished(exited, timeout) {
            return None;
        }

        match std::mem::replace(&mut self.state, State::Finished) {
            State::Running { handle, .. } => Some(join_polling_thread(handle)),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Cancel the polling thread, close the client within `timeout` and wait
    /// the same budget for the thread to exit. A thread still blocked after
    /// that is detached.
    ///
    /// Returns the thread's error if it failed and nobody collected it yet.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), SourceError> {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Stopped => Ok(()),
            State::NotStarted | State::Finished => {
                self.queue = None;
                self.client.close(timeout);
                info!(client_id = %self.client_id, "Producer stopped");
                Ok(())
            }
            State::Running {
                cancel,
                exited,
                handle,
            } => {
                drop(cancel);
                self.client.close(timeout);

                if !wait_until_finished(&exited, timeout) {
                    warn!(
                        client_id = %self.client_id,
                        "Polling thread did not exit within {:?}, detaching it", timeout
                    );
                    metrics::counter!(POLLING_THREAD_EXITS_COUNTER, "outcome" => "detached")
                        .increment(1);
                    return Ok(());
                }

                info!(client_id = %self.client_id, "Producer stopped");
                join_polling_thread(handle)
            }
        }
    }
}

impl<C: BrokerClient> Drop for QueuedProducer<C> {
    fn drop(&mut self) {
        if let State::Running { cancel, .. } = std::mem::replace(&mut self.state, State::Stopped) {
            drop(cancel);
            self.client.close(Duration::ZERO);
        }
    }
}

fn wait_until_finished(exited: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(exited.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

fn join_polling_thread(handle: PollingThread) -> Result<(), SourceError> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => {
            error!("Polling thread panicked");
            Err(SourceError::ProducerPanicked)
        }
    }
}

fn is_cancelled(cancelled: &Receiver<()>) -> bool {
    matches!(cancelled.try_recv(), Ok(()) | Err(TryRecvError::Disconnected))
}

/// Everything the background thread owns.
struct PollingLoop<C: BrokerClient> {
    client: Arc<C>,
    listener: Arc<dyn RebalanceListener>,
    queue: Sender<RawBatch>,
    cancelled: Receiver<()>,
    topic: String,
    poll_timeout: Duration,
    offer_timeout: Duration,
}

impl<C: BrokerClient> PollingLoop<C> {
    fn run(self) -> Result<(), SourceError> {
        let result = self.poll_until_cancelled();
        let outcome = match &result {
            Ok(()) => "stopped",
            Err(_) => "failed",
        };
        metrics::counter!(POLLING_THREAD_EXITS_COUNTER, "outcome" => outcome).increment(1);
        result
    }

    fn poll_until_cancelled(&self) -> Result<(), SourceError> {
        if let Err(e) = self
            .client
            .subscribe(&self.topic, self.listener.clone())
        {
            error!(topic = %self.topic, error = ?e, "Failed to subscribe, polling thread exiting");
            return Err(e.into());
        }

        let mut consecutive_errors: u32 = 0;
        while !is_cancelled(&self.cancelled) {
            let batch = match self.client.poll(self.poll_timeout) {
                Ok(batch) => {
                    consecutive_errors = 0;
                    batch
                }
                Err(e) if is_cancelled(&self.cancelled) => {
                    debug!(error = ?e, "Poll interrupted by shutdown");
                    break;
                }
                Err(BrokerError::Transient(e)) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff = TRANSIENT_BACKOFF_STEP * consecutive_errors.min(MAX_BACKOFF_STEPS);
                    warn!(
                        error = ?e,
                        attempt = consecutive_errors,
                        ?backoff,
                        "Recoverable broker error, backing off"
                    );
                    // Cancellation cuts the backoff short
                    match self.cancelled.recv_timeout(backoff) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Broker poll failed, polling thread exiting");
                    return Err(e.into());
                }
            };

            if batch.is_empty() {
                continue;
            }

            metrics::counter!(BATCHES_POLLED_COUNTER).increment(1);
            metrics::counter!(RECORDS_POLLED_COUNTER).increment(batch.len() as u64);
            metrics::histogram!(BATCH_SIZE_HISTOGRAM).record(batch.len() as f64);
            debug!(records = batch.len(), "Polled batch");

            match self.offer(batch) {
                Offer::Delivered => {}
                Offer::Interrupted(batch) => {
                    warn!(
                        records = batch.len(),
                        partitions = ?batch.partitions(),
                        "Shutdown interrupted the queue hand-off, dropping batch"
                    );
                    metrics::counter!(BATCHES_DROPPED_COUNTER).increment(1);
                }
                Offer::Disconnected => {
                    info!("Queue reader is gone, polling thread exiting");
                    break;
                }
            }
        }

        info!(topic = %self.topic, "Polling thread exiting");
        Ok(())
    }

    /// Keep offering the batch until the queue takes it, the reader goes
    /// away, or shutdown is requested between attempts.
    fn offer(&self, mut batch: RawBatch) -> Offer {
        loop {
            match self.queue.send_timeout(batch, self.offer_timeout) {
                Ok(()) => return Offer::Delivered,
                Err(SendTimeoutError::Disconnected(_)) => return Offer::Disconnected,
                Err(SendTimeoutError::Timeout(returned)) => {
                    metrics::counter!(QUEUE_OFFER_RETRIES_COUNTER).increment(1);
                    if is_cancelled(&self.cancelled) {
                        return Offer::Interrupted(returned);
                    }
                    debug!(records = returned.len(), "Queue full, retrying hand-off");
                    batch = returned;
                }
            }
        }
    }
}
