// ==== Polling thread ====
/// Counter for non-empty batches returned by broker polls
pub const BATCHES_POLLED_COUNTER: &str = "eventhubs_source_batches_polled_total";

/// Counter for records returned by broker polls
pub const RECORDS_POLLED_COUNTER: &str = "eventhubs_source_records_polled_total";

/// Histogram for the number of records in each polled batch
pub const BATCH_SIZE_HISTOGRAM: &str = "eventhubs_source_batch_size";

/// Counter for hand-off attempts that timed out because the queue was full
pub const QUEUE_OFFER_RETRIES_COUNTER: &str = "eventhubs_source_queue_offer_retries_total";

/// Counter for batches abandoned because shutdown interrupted the hand-off
pub const BATCHES_DROPPED_COUNTER: &str = "eventhubs_source_batches_dropped_total";

/// Counter for polling thread exits, labelled by outcome
pub const POLLING_THREAD_EXITS_COUNTER: &str = "eventhubs_source_polling_thread_exits_total";

// ==== Poll side ====
/// Counter for records handed to the caller
pub const RECORDS_EMITTED_COUNTER: &str = "eventhubs_source_records_emitted_total";

/// Counter for caller polls that returned no data
pub const EMPTY_POLLS_COUNTER: &str = "eventhubs_source_empty_polls_total";

// ==== Rebalance ====
/// Counter for partition positioning decisions on assignment, labelled by source (stored/earliest/latest)
pub const REBALANCE_SEEKS_COUNTER: &str = "eventhubs_source_rebalance_seeks_total";

/// Counter for rebalance events, labelled by event type
pub const REBALANCE_EVENTS_COUNTER: &str = "eventhubs_source_rebalance_events_total";

// ==== Kafka client ====
/// Counter for librdkafka consumer errors, labelled by level and error
pub const KAFKA_CONSUMER_ERRORS_COUNTER: &str = "eventhubs_source_kafka_errors_total";
