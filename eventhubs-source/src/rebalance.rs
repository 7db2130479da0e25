use std::slice;

use tracing::{debug, info};

use crate::config::SeekMode;
use crate::error::{BrokerError, SourceError};
use crate::metrics_consts::{REBALANCE_EVENTS_COUNTER, REBALANCE_SEEKS_COUNTER};
use crate::offsets::{OffsetLookup, TopicPartitionOffsetProvider};
use crate::types::{OffsetMarker, PartitionKey};

/// Partition ownership change, dispatched synchronously by the broker client
/// from inside its poll call.
#[derive(Debug, Clone, Copy)]
pub enum RebalanceEvent<'a> {
    Revoked(&'a [PartitionKey]),
    Assigned(&'a [PartitionKey]),
}

impl RebalanceEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            RebalanceEvent::Revoked(_) => "revoked",
            RebalanceEvent::Assigned(_) => "assigned",
        }
    }
}

/// Positioning operations the broker client exposes to rebalance listeners.
#[cfg_attr(test, mockall::automock)]
pub trait PartitionSeeker {
    fn seek(&self, partition: &PartitionKey, offset: OffsetMarker) -> Result<(), BrokerError>;

    fn seek_to_beginning(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError>;

    fn seek_to_end(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError>;
}

/// Callback installed on subscription. It blocks the broker client until it
/// returns, so implementations must do bounded work. An error is fatal to the
/// polling thread.
pub trait RebalanceListener: Send + Sync {
    fn on_rebalance(
        &self,
        event: RebalanceEvent<'_>,
        seeker: &dyn PartitionSeeker,
    ) -> Result<(), SourceError>;
}

/// Resumes every newly assigned partition from the position stored for it,
/// or from the configured boundary when nothing was stored yet.
pub struct OffsetSeekingRebalanceListener {
    offsets: TopicPartitionOffsetProvider,
    seek_mode: SeekMode,
}

impl OffsetSeekingRebalanceListener {
    pub fn new(offsets: TopicPartitionOffsetProvider, seek_mode: SeekMode) -> Self {
        Self { offsets, seek_mode }
    }

    fn position(
        &self,
        partition: &PartitionKey,
        seeker: &dyn PartitionSeeker,
    ) -> Result<(), SourceError> {
        match self.offsets.get_offset(partition)? {
            OffsetLookup::Found(marker) => {
                info!(%partition, offset = %marker, "Seeking to stored offset");
                metrics::counter!(REBALANCE_SEEKS_COUNTER, "source" => "stored").increment(1);
                seeker.seek(partition, marker)?;
            }
            OffsetLookup::NotFound => {
                info!(
                    %partition,
                    seek_mode = self.seek_mode.as_str(),
                    "No stored offset, seeking to configured boundary"
                );
                metrics::counter!(REBALANCE_SEEKS_COUNTER, "source" => self.seek_mode.as_str())
                    .increment(1);
                let partitions = slice::from_ref(partition);
                match self.seek_mode {
                    SeekMode::Latest => seeker.seek_to_end(partitions)?,
                    SeekMode::Earliest => seeker.seek_to_beginning(partitions)?,
                }
            }
        }
        Ok(())
    }
}

impl RebalanceListener for OffsetSeekingRebalanceListener {
    fn on_rebalance(
        &self,
        event: RebalanceEvent<'_>,
        seeker: &dyn PartitionSeeker,
    ) -> Result<(), SourceError> {
        metrics::counter!(REBALANCE_EVENTS_COUNTER, "event_type" => event.name()).increment(1);

        match event {
            // Processed positions are committed by the framework, nothing to flush
            RebalanceEvent::Revoked(partitions) => {
                debug!("{} partitions revoked", partitions.len());
                Ok(())
            }
            RebalanceEvent::Assigned(partitions) => {
                info!("{} partitions assigned", partitions.len());
                for partition in partitions {
                    self.position(partition, seeker)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::OffsetStoreError;
    use crate::offsets::MockOffsetStorageReader;

    fn p(partition: i32) -> PartitionKey {
        PartitionKey::new("hub", partition)
    }

    fn listener_with(
        stored: Vec<(i32, i64)>,
        seek_mode: SeekMode,
    ) -> OffsetSeekingRebalanceListener {
        let mut reader = MockOffsetStorageReader::new();
        reader.expect_read().returning(move |partition| {
            Ok(stored
                .iter()
                .find(|(number, _)| *number == partition.partition())
                .map(|(_, offset)| OffsetMarker::new(*offset).unwrap()))
        });
        let provider = TopicPartitionOffsetProvider::new(Arc::new(reader));
        OffsetSeekingRebalanceListener::new(provider, seek_mode)
    }

    #[test]
    fn test_stored_offset_seeks_exactly_once_and_never_to_a_boundary() {
        let listener = listener_with(vec![(0, 42)], SeekMode::Latest);

        let mut seeker = MockPartitionSeeker::new();
        seeker
            .expect_seek()
            .withf(|partition, offset| partition.partition() == 0 && offset.value() == 42)
            .times(1)
            .returning(|_, _| Ok(()));
        seeker.expect_seek_to_beginning().never();
        seeker.expect_seek_to_end().never();

        listener
            .on_rebalance(RebalanceEvent::Assigned(&[p(0)]), &seeker)
            .unwrap();
    }

    #[test]
    fn test_missing_offset_with_latest_seeks_to_end() {
        let listener = listener_with(vec![], SeekMode::Latest);

        let mut seeker = MockPartitionSeeker::new();
        seeker.expect_seek().never();
        seeker.expect_seek_to_beginning().never();
        seeker
            .expect_seek_to_end()
            .withf(|partitions| partitions.len() == 1 && partitions[0] == p(3))
            .times(1)
            .returning(|_| Ok(()));

        listener
            .on_rebalance(RebalanceEvent::Assigned(&[p(3)]), &seeker)
            .unwrap();
    }

    #[test]
    fn test_missing_offset_with_earliest_seeks_to_beginning() {
        let listener = listener_with(vec![], SeekMode::Earliest);

        let mut seeker = MockPartitionSeeker::new();
        seeker.expect_seek().never();
        seeker.expect_seek_to_end().never();
        seeker
            .expect_seek_to_beginning()
            .withf(|partitions| partitions.len() == 1 && partitions[0] == p(1))
            .times(1)
            .returning(|_| Ok(()));

        listener
            .on_rebalance(RebalanceEvent::Assigned(&[p(1)]), &seeker)
            .unwrap();
    }

    #[test]
    fn test_partitions_are_positioned_independently() {
        // P0 has a stored marker, P1 does not
        let listener = listener_with(vec![(0, 42)], SeekMode::Earliest);

        let mut seeker = MockPartitionSeeker::new();
        seeker
            .expect_seek()
            .withf(|partition, offset| *partition == p(0) && offset.value() == 42)
            .times(1)
            .returning(|_, _| Ok(()));
        seeker
            .expect_seek_to_beginning()
            .withf(|partitions| partitions.len() == 1 && partitions[0] == p(1))
            .times(1)
            .returning(|_| Ok(()));
        seeker.expect_seek_to_end().never();

        listener
            .on_rebalance(RebalanceEvent::Assigned(&[p(0), p(1)]), &seeker)
            .unwrap();
    }

    #[test]
    fn test_revocation_does_nothing() {
        let mut reader = MockOffsetStorageReader::new();
        reader.expect_read().never();
        let listener = OffsetSeekingRebalanceListener::new(
            TopicPartitionOffsetProvider::new(Arc::new(reader)),
            SeekMode::Earliest,
        );

        let mut seeker = MockPartitionSeeker::new();
        seeker.expect_seek().never();
        seeker.expect_seek_to_beginning().never();
        seeker.expect_seek_to_end().never();

        listener
            .on_rebalance(RebalanceEvent::Revoked(&[p(0), p(1)]), &seeker)
            .unwrap();
    }

    #[test]
    fn test_offset_store_failure_is_propagated() {
        let mut reader = MockOffsetStorageReader::new();
        reader
            .expect_read()
            .times(1)
            .returning(|_| Err(OffsetStoreError::Unavailable("down".to_string())));
        let listener = OffsetSeekingRebalanceListener::new(
            TopicPartitionOffsetProvider::new(Arc::new(reader)),
            SeekMode::Latest,
        );

        let mut seeker = MockPartitionSeeker::new();
        seeker.expect_seek().never();
        seeker.expect_seek_to_end().never();

        let result = listener.on_rebalance(RebalanceEvent::Assigned(&[p(0)]), &seeker);

        assert!(matches!(result, Err(SourceError::OffsetStore(_))));
    }

    #[test]
    fn test_seek_failure_is_propagated() {
        let listener = listener_with(vec![(0, 5)], SeekMode::Latest);

        let mut seeker = MockPartitionSeeker::new();
        seeker
            .expect_seek()
            .returning(|_, _| Err(BrokerError::Client("seek failed".to_string())));

        let result = listener.on_rebalance(RebalanceEvent::Assigned(&[p(0)]), &seeker);

        assert!(matches!(result, Err(SourceError::Broker(_))));
    }
}
