use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Message};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::SourceSettings;
use crate::error::BrokerError;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::context::SourceConsumerContext;
use crate::metrics_consts::KAFKA_CONSUMER_ERRORS_COUNTER;
use crate::rebalance::RebalanceListener;
use crate::types::{RawBatch, RawRecord};

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [`BrokerClient`] backed by a librdkafka consumer pointed at the EventHubs
/// Kafka endpoint.
pub struct KafkaBrokerClient {
    consumer: BaseConsumer<SourceConsumerContext>,
    max_poll_records: usize,
    closed: AtomicBool,
}

impl KafkaBrokerClient {
    pub fn new(config: &ClientConfig, max_poll_records: usize) -> Result<Self, BrokerError> {
        let consumer: BaseConsumer<SourceConsumerContext> = config
            .create_with_context(SourceConsumerContext::new())
            .map_err(BrokerError::kafka("create consumer"))?;

        Ok(Self {
            consumer,
            max_poll_records: max_poll_records.max(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_settings(settings: &SourceSettings) -> Result<Self, BrokerError> {
        let config = ConsumerConfigBuilder::from_settings(settings).build();
        info!(
            client_id = %settings.client_id,
            group_id = %settings.consumer_group,
            "Creating Kafka consumer"
        );
        Self::new(&config, settings.max_poll_records)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl BrokerClient for KafkaBrokerClient {
    fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.consumer.context().install_listener(listener)?;
        self.consumer
            .subscribe(&[topic])
            .map_err(BrokerError::kafka("subscribe"))?;

        info!(topic, "Subscribed to topic");
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<RawBatch, BrokerError> {
        let mut batch = RawBatch::default();
        // Only the first poll waits, the rest drain what is already buffered
        let mut wait = timeout;

        while batch.len() < self.max_poll_records {
            if self.is_closed() {
                break;
            }
            let next = self.consumer.poll(wait);

            // Rebalance callbacks run inside poll; their failures surface here
            if let Some(e) = self.consumer.context().take_deferred_error() {
                return Err(e);
            }

            match next {
                None => break,
                Some(Ok(message)) => {
                    batch.push(raw_record(&message));
                    wait = Duration::ZERO;
                }
                Some(Err(e)) if is_recoverable(&e) => {
                    // Records already drained are handed over, the error resurfaces if it persists
                    if batch.is_empty() {
                        return Err(BrokerError::Transient(e));
                    }
                    break;
                }
                Some(Err(KafkaError::Canceled)) => return Err(BrokerError::Closed),
                Some(Err(e)) => {
                    return Err(BrokerError::Kafka {
                        operation: "poll",
                        source: e,
                    })
                }
            }
        }

        if batch.is_empty() && self.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(batch)
    }

    /// Leave the group and close the consumer queue, polling for the close to
    /// complete for at most `timeout`. Records arriving meanwhile are discarded.
    ///
    /// If the budget runs out, librdkafka finishes closing when the client is dropped.
    fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(?timeout, "Closing Kafka consumer");

        if let Err(e) = self.consumer.close_queue() {
            error!(error = ?e, "Failed to close Kafka consumer queue");
            return;
        }

        let deadline = Instant::now() + timeout;
        while !self.consumer.closed() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(?timeout, "Kafka consumer did not close within its budget");
                return;
            }
            if let Some(Err(e)) = self.consumer.poll(remaining.min(CLOSE_POLL_INTERVAL)) {
                debug!(error = ?e, "Consumer error while closing");
            }
        }
        info!("Kafka consumer closed");
    }
}

fn raw_record(message: &BorrowedMessage<'_>) -> RawRecord {
    RawRecord {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec),
        timestamp: message.timestamp().to_millis(),
    }
}

/// Log and count a consumer error. Returns `true` when librdkafka recovers
/// on its own and polling can carry on after a backoff.
fn is_recoverable(e: &KafkaError) -> bool {
    let (level, label, recoverable) = match e {
        KafkaError::PartitionEOF(_)
        | KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => {
            ("info", "partition_eof", true)
        }
        KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut) => {
            ("info", "op_timed_out", true)
        }
        // "auto.offset.reset" moves the partition to the configured boundary
        KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange) => {
            ("info", "offset_out_of_range", true)
        }
        KafkaError::MessageConsumption(_) => ("warn", "consumer", true),
        KafkaError::Global(RDKafkaErrorCode::AllBrokersDown) => ("warn", "all_brokers_down", true),
        KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure) => {
            ("warn", "broker_transport", true)
        }
        KafkaError::Global(RDKafkaErrorCode::Authentication) => ("fatal", "authentication", false),
        KafkaError::Global(_) => ("warn", "global", true),
        KafkaError::MessageConsumptionFatal(_) => ("fatal", "consumer", false),
        KafkaError::Canceled => ("info", "canceled", false),
        _ => ("fatal", "unexpected", false),
    };

    metrics::counter!(KAFKA_CONSUMER_ERRORS_COUNTER, "level" => level, "error" => label)
        .increment(1);

    match (level, recoverable) {
        ("info", _) => debug!(error = ?e, "Kafka consumer notice: {label}"),
        (_, true) => warn!(error = ?e, "Recoverable Kafka consumer error: {label}"),
        (_, false) => error!(error = ?e, "Kafka consumer error, giving up: {label}"),
    }

    recoverable
}
