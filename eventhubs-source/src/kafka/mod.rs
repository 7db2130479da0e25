// Kafka module - rdkafka-backed broker client for the EventHubs Kafka endpoint
pub mod client;
pub mod config;
pub mod context;

// Public API
pub use client::KafkaBrokerClient;
pub use config::ConsumerConfigBuilder;
pub use context::SourceConsumerContext;
