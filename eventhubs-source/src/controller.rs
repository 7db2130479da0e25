use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info};

use crate::broker::BrokerClient;
use crate::error::SourceError;
use crate::metrics_consts::{EMPTY_POLLS_COUNTER, RECORDS_EMITTED_COUNTER};
use crate::producer::QueuedProducer;
use crate::types::{OffsetMarker, RawBatch, SourceRecord};

/// Reading side of the bounded queue: turns queued batches into output
/// records for the caller and owns the producer's lifecycle.
pub struct ConsumerController<C: BrokerClient> {
    producer: QueuedProducer<C>,
    queue: Receiver<RawBatch>,
    output_topics: Vec<String>,
    producer_failed: bool,
}

impl<C: BrokerClient> ConsumerController<C> {
    pub fn new(
        producer: QueuedProducer<C>,
        queue: Receiver<RawBatch>,
        output_topics: Vec<String>,
    ) -> Self {
        Self {
            producer,
            queue,
            output_topics,
            producer_failed: false,
        }
    }

    pub fn start(&mut self) -> Result<(), SourceError> {
        self.producer.start()
    }

    /// Take the next batch, waiting up to `timeout`. An empty result means no
    /// data arrived this cycle.
    ///
    /// When the polling thread has died, its error is returned once and
    /// every later call reports [`SourceError::ProducerTerminated`].
    pub fn poll(&mut self, timeout: Duration) -> Result<Vec<SourceRecord>, SourceError> {
        match self.queue.recv_timeout(timeout) {
            Ok(batch) => {
                let records = self.convert(batch);
                metrics::counter!(RECORDS_EMITTED_COUNTER).increment(records.len() as u64);
                debug!(records = records.len(), "Emitting records");
                Ok(records)
            }
            Err(RecvTimeoutError::Timeout) => {
                metrics::counter!(EMPTY_POLLS_COUNTER).increment(1);
                Ok(Vec::new())
            }
            Err(RecvTimeoutError::Disconnected) => match self.producer.wait_for_exit(timeout) {
                Some(Err(e)) => {
                    error!(error = ?e, "Polling thread terminated");
                    self.producer_failed = true;
                    Err(e)
                }
                Some(Ok(())) => {
                    info!("Polling thread exited");
                    Ok(Vec::new())
                }
                None if self.producer_failed => Err(SourceError::ProducerTerminated),
                None => Ok(Vec::new()),
            },
        }
    }

    /// Stop the producer. Safe to call when it was never started.
    pub fn close(&mut self, timeout: Duration) -> Result<(), SourceError> {
        self.producer.stop(timeout)
    }

    /// One output record per raw record and output topic, in batch order.
    fn convert(&self, batch: RawBatch) -> Vec<SourceRecord> {
        let mut records = Vec::with_capacity(batch.len() * self.output_topics.len());
        for raw in batch {
            let source_partition = raw.partition_key();
            let source_offset = OffsetMarker::after(raw.offset);
            for topic in &self.output_topics {
                records.push(SourceRecord {
                    source_partition: source_partition.clone(),
                    source_offset,
                    topic: topic.clone(),
                    key: raw.key.clone(),
                    value: raw.value.clone(),
                    timestamp: raw.timestamp,
                });
            }
        }
        records
    }
}
