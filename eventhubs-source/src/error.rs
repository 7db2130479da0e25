use std::path::PathBuf;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors raised while validating the task configuration. These are always
/// surfaced before any consumer is created or any thread is spawned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value '{0}' for KAFKA_CONSUMER_OFFSET_RESET: allowed values are: earliest/latest")]
    InvalidSeekMode(String),
    #[error("malformed consumer property '{0}', expected key=value")]
    InvalidConsumerProperty(String),
    #[error("{0} must not be empty")]
    EmptyValue(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

/// Errors reading previously committed positions from the external offset store.
#[derive(Error, Debug)]
pub enum OffsetStoreError {
    #[error("failed to read offset store at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse offset store at {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("offset store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the broker client while subscribing, polling or seeking.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka {operation} failed")]
    Kafka {
        operation: &'static str,
        #[source]
        source: KafkaError,
    },
    #[error("recoverable kafka error while polling")]
    Transient(#[source] KafkaError),
    #[error("rebalance callback failed")]
    Rebalance(#[source] Box<SourceError>),
    #[error("a rebalance listener is already installed")]
    AlreadySubscribed,
    #[error("broker client is closed")]
    Closed,
    #[error("broker client error: {0}")]
    Client(String),
}

impl BrokerError {
    pub fn kafka(operation: &'static str) -> impl FnOnce(KafkaError) -> Self {
        move |source| BrokerError::Kafka { operation, source }
    }
}

/// Top level error of the source: configuration problems, offset lookups,
/// broker failures and the death of the background polling thread.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("offset lookup failed")]
    OffsetStore(#[from] OffsetStoreError),
    #[error("broker client failed")]
    Broker(#[from] BrokerError),
    #[error("failed to spawn polling thread")]
    Spawn(#[source] std::io::Error),
    #[error("polling thread panicked")]
    ProducerPanicked,
    #[error("polling thread has already terminated")]
    ProducerTerminated,
}
