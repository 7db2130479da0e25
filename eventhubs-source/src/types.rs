use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single partition of a topic. This is also the shape of the source
/// partition the framework stores committed positions under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    topic: String,
    partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("offset marker must be non-negative, got {0}")]
pub struct NegativeOffsetError(pub i64);

/// Position within a partition as recorded by the external offset store.
///
/// A marker always names the next record to read: records emitted by this
/// source carry `offset + 1`, so resuming from a marker never replays the
/// last processed record and never skips the following one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct OffsetMarker(i64);

impl OffsetMarker {
    pub fn new(value: i64) -> Result<Self, NegativeOffsetError> {
        if value < 0 {
            return Err(NegativeOffsetError(value));
        }
        Ok(Self(value))
    }

    /// Marker for the position following a consumed record.
    pub fn after(offset: i64) -> Self {
        Self(offset.max(-1) + 1)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for OffsetMarker {
    type Error = NegativeOffsetError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OffsetMarker> for i64 {
    fn from(marker: OffsetMarker) -> Self {
        marker.0
    }
}

impl fmt::Display for OffsetMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record exactly as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}

impl RawRecord {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.topic.clone(), self.partition)
    }
}

/// The records returned by one broker poll, in delivery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatch {
    records: Vec<RawRecord>,
}

impl RawBatch {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: RawRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct partitions present in the batch, in order of first appearance.
    pub fn partitions(&self) -> Vec<PartitionKey> {
        let mut partitions: Vec<PartitionKey> = Vec::new();
        for record in &self.records {
            let key = record.partition_key();
            if !partitions.contains(&key) {
                partitions.push(key);
            }
        }
        partitions
    }
}

impl IntoIterator for RawBatch {
    type Item = RawRecord;
    type IntoIter = std::vec::IntoIter<RawRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Output shape handed to the caller of the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRecord {
    pub source_partition: PartitionKey,
    pub source_offset: OffsetMarker,
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, partition: i32, offset: i64) -> RawRecord {
        RawRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            value: Some(b"payload".to_vec()),
            timestamp: None,
        }
    }

    #[test]
    fn test_offset_marker_rejects_negative_values() {
        assert_eq!(OffsetMarker::new(-1), Err(NegativeOffsetError(-1)));
        assert_eq!(OffsetMarker::new(0).unwrap().value(), 0);
        assert_eq!(OffsetMarker::after(41).value(), 42);
    }

    #[test]
    fn test_offset_marker_deserialization_is_validated() {
        let marker: OffsetMarker = serde_json::from_str("42").unwrap();
        assert_eq!(marker.value(), 42);
        assert!(serde_json::from_str::<OffsetMarker>("-3").is_err());
    }

    #[test]
    fn test_batch_partitions_keep_first_seen_order() {
        let batch = RawBatch::new(vec![
            record("hub", 1, 10),
            record("hub", 0, 3),
            record("hub", 1, 11),
        ]);

        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.partitions(),
            vec![PartitionKey::new("hub", 1), PartitionKey::new("hub", 0)]
        );
    }

    #[test]
    fn test_partition_key_display() {
        assert_eq!(PartitionKey::new("hub", 7).to_string(), "hub:7");
    }
}
