use rdkafka::ClientConfig;

use crate::config::{ConsumerProperties, SeekMode, SourceSettings};

/// Kafka consumer configuration builder for the source task.
///
/// Offsets are never committed by the consumer itself: positions are made
/// durable by the surrounding framework and restored by the rebalance
/// listener, so auto commit and auto offset store are both disabled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str, client_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("client.id", client_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    /// Builder pre-populated from validated task settings.
    pub fn from_settings(settings: &SourceSettings) -> Self {
        Self::new(
            &settings.kafka_hosts,
            &settings.consumer_group,
            &settings.client_id,
        )
        .with_tls(settings.kafka_tls)
        .with_offset_reset(settings.seek_mode)
        .with_properties(&settings.consumer_properties)
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Backstop for positions that fall out of range after the listener positioned a partition
    pub fn with_offset_reset(mut self, seek_mode: SeekMode) -> Self {
        self.config.set("auto.offset.reset", seek_mode.as_str());
        self
    }

    /// Pass-through settings, applied last so they win over defaults
    pub fn with_properties(mut self, properties: &ConsumerProperties) -> Self {
        for (key, value) in properties.iter() {
            self.config.set(key, value);
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_never_commits_on_its_own() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group", "client#1").build();

        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("client.id"), Some("client#1"));
    }

    #[test]
    fn test_properties_override_defaults() {
        let properties: ConsumerProperties =
            "security.protocol=SASL_SSL,socket.timeout.ms=30000".parse().unwrap();

        let config = ConsumerConfigBuilder::new("localhost:9092", "group", "client")
            .with_tls(true)
            .with_offset_reset(SeekMode::Earliest)
            .with_properties(&properties)
            .build();

        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("socket.timeout.ms"), Some("30000"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }
}
