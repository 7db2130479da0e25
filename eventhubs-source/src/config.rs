use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use uuid::Uuid;

use crate::error::ConfigError;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "eventhubs-source")]
    pub connector_name: String,

    // The EventHub (topic on the Kafka endpoint) to consume from
    pub eventhub_name: String,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "eventhubs-source")]
    pub kafka_consumer_group: String,

    // Where to start when no position was committed for a partition: earliest, latest.
    // Validated when the task starts, not when the environment is read.
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    // Pass-through librdkafka settings (e.g. SASL for the EventHubs endpoint): key=value,key=value
    #[envconfig(default = "")]
    pub kafka_consumer_properties: ConsumerProperties,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "30")]
    pub consumer_close_timeout_secs: u64,

    #[envconfig(default = "500")]
    pub consumer_max_poll_records: usize,

    #[envconfig(default = "10")]
    pub records_queue_capacity: usize,

    // Comma separated; when empty, records are mirrored to a topic named after the EventHub
    #[envconfig(default = "")]
    pub output_topics: String,

    // JSON file with positions committed by the surrounding framework, read-only
    pub offset_store_path: Option<String>,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_close_timeout_secs)
    }

    /// Output topics, or the EventHub name when none are configured.
    pub fn output_topics(&self) -> Vec<String> {
        let topics: Vec<String> = self
            .output_topics
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect();

        if topics.is_empty() {
            vec![self.eventhub_name.trim().to_owned()]
        } else {
            topics
        }
    }

    /// Validate everything the task needs before anything is created.
    pub fn validate(&self) -> Result<SourceSettings, ConfigError> {
        let seek_mode: SeekMode = self.kafka_consumer_offset_reset.parse()?;

        let connector_name = self.connector_name.trim();
        if connector_name.is_empty() {
            return Err(ConfigError::EmptyValue("CONNECTOR_NAME"));
        }
        let topic = self.eventhub_name.trim();
        if topic.is_empty() {
            return Err(ConfigError::EmptyValue("EVENTHUB_NAME"));
        }
        if self.records_queue_capacity == 0 {
            return Err(ConfigError::ZeroValue("RECORDS_QUEUE_CAPACITY"));
        }
        if self.consumer_max_poll_records == 0 {
            return Err(ConfigError::ZeroValue("CONSUMER_MAX_POLL_RECORDS"));
        }

        Ok(SourceSettings {
            connector_name: connector_name.to_owned(),
            client_id: format!("{}#{}", connector_name, Uuid::new_v4()),
            topic: topic.to_owned(),
            seek_mode,
            output_topics: self.output_topics(),
            close_timeout: self.close_timeout(),
            queue_capacity: self.records_queue_capacity,
            max_poll_records: self.consumer_max_poll_records,
            kafka_hosts: self.kafka_hosts.clone(),
            consumer_group: self.kafka_consumer_group.clone(),
            kafka_tls: self.kafka_tls,
            consumer_properties: self.kafka_consumer_properties.clone(),
        })
    }
}

/// Validated settings for one source task.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub connector_name: String,
    pub client_id: String,
    pub topic: String,
    pub seek_mode: SeekMode,
    pub output_topics: Vec<String>,
    pub close_timeout: Duration,
    pub queue_capacity: usize,
    pub max_poll_records: usize,
    pub kafka_hosts: String,
    pub consumer_group: String,
    pub kafka_tls: bool,
    pub consumer_properties: ConsumerProperties,
}

/// Where an assigned partition starts when the offset store has no position for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Earliest,
    Latest,
}

impl SeekMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeekMode::Earliest => "earliest",
            SeekMode::Latest => "latest",
        }
    }
}

impl FromStr for SeekMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("earliest") {
            Ok(SeekMode::Earliest)
        } else if s.eq_ignore_ascii_case("latest") {
            Ok(SeekMode::Latest)
        } else {
            Err(ConfigError::InvalidSeekMode(s.to_owned()))
        }
    }
}

// Keys whose values are credentials (the EventHubs connection string travels as sasl.password)
const SENSITIVE_PROPERTY_MARKERS: &[&str] = &["password", "secret", "sasl.jaas", "sasl.oauthbearer"];

#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConsumerProperties(pub Vec<(String, String)>);

impl ConsumerProperties {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn is_sensitive(key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        SENSITIVE_PROPERTY_MARKERS
            .iter()
            .any(|marker| key.contains(marker))
    }
}

impl fmt::Debug for ConsumerProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in self.iter() {
            if Self::is_sensitive(key) {
                map.entry(&key, &"<redacted>");
            } else {
                map.entry(&key, &value);
            }
        }
        map.finish()
    }
}

impl FromStr for ConsumerProperties {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut properties = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(ConfigError::InvalidConsumerProperty(entry.to_owned()));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidConsumerProperty(entry.to_owned()));
            }
            properties.push((key.to_owned(), value.trim().to_owned()));
        }
        Ok(ConsumerProperties(properties))
    }
}
