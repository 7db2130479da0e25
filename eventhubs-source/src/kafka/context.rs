use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::rebalance::{PartitionSeeker, RebalanceEvent, RebalanceListener};
use crate::types::{OffsetMarker, PartitionKey};

impl From<TopicPartitionListElem<'_>> for PartitionKey {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Consumer context that hands librdkafka rebalances to the installed
/// [`RebalanceListener`].
///
/// Assignments are positioned before librdkafka applies them: the listener's
/// seeks are recorded and written into the pending assignment's starting
/// offsets, which is how librdkafka expects a rebalance callback to seek.
///
/// A listener failure cannot be returned from inside the callback, so it is
/// parked here and handed back by the next poll.
pub struct SourceConsumerContext {
    listener: OnceLock<Arc<dyn RebalanceListener>>,
    deferred_error: Mutex<Option<BrokerError>>,
}

impl SourceConsumerContext {
    pub fn new() -> Self {
        Self {
            listener: OnceLock::new(),
            deferred_error: Mutex::new(None),
        }
    }

    pub fn install_listener(&self, listener: Arc<dyn RebalanceListener>) -> Result<(), BrokerError> {
        self.listener
            .set(listener)
            .map_err(|_| BrokerError::AlreadySubscribed)
    }

    /// Error raised inside a rebalance callback since the last call, if any.
    pub fn take_deferred_error(&self) -> Option<BrokerError> {
        match self.deferred_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn defer(&self, failure: BrokerError) {
        let mut slot = match self.deferred_error.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Keep the first failure, later ones are usually consequences of it
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    fn revoke(&self, listener: &dyn RebalanceListener, tpl: &TopicPartitionList) {
        let partitions: Vec<PartitionKey> =
            tpl.elements().into_iter().map(PartitionKey::from).collect();

        if let Err(e) = listener.on_rebalance(RebalanceEvent::Revoked(&partitions), &NoopSeeker) {
            error!(error = ?e, "Rebalance listener failed on revocation");
            self.defer(BrokerError::Rebalance(Box::new(e)));
        }
    }

    fn assign(&self, listener: &dyn RebalanceListener, tpl: &TopicPartitionList) {
        let partitions: Vec<PartitionKey> =
            tpl.elements().into_iter().map(PartitionKey::from).collect();

        let seeker = AssignmentSeeker::default();
        if let Err(e) = listener.on_rebalance(RebalanceEvent::Assigned(&partitions), &seeker) {
            error!(error = ?e, "Rebalance listener failed on assignment");
            self.defer(BrokerError::Rebalance(Box::new(e)));
            return;
        }

        for mut elem in tpl.elements() {
            let key = PartitionKey::new(elem.topic(), elem.partition());
            let Some(offset) = seeker.take(&key) else {
                continue;
            };
            debug!(partition = %key, ?offset, "Setting starting offset for assigned partition");
            if let Err(e) = elem.set_offset(offset) {
                error!(partition = %key, error = ?e, "Failed to set starting offset");
                self.defer(BrokerError::Kafka {
                    operation: "seek",
                    source: e,
                });
            }
        }
    }
}

impl Default for SourceConsumerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientContext for SourceConsumerContext {}

impl ConsumerContext for SourceConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);

        let Some(listener) = self.listener.get() else {
            warn!("Rebalance received before a listener was installed");
            return;
        };

        match rebalance {
            Rebalance::Revoke(partitions) => {
                // Short-circuit for empty TPL (cooperative-sticky sends these frequently)
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                self.revoke(listener.as_ref(), partitions);
            }
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }
                self.assign(listener.as_ref(), partitions);
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {e:?}");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);
    }
}

/// Records the listener's positioning decisions for a pending assignment.
#[derive(Default)]
struct AssignmentSeeker {
    positions: RefCell<HashMap<PartitionKey, Offset>>,
}

impl AssignmentSeeker {
    fn take(&self, partition: &PartitionKey) -> Option<Offset> {
        self.positions.borrow_mut().remove(partition)
    }

    fn record(&self, partitions: &[PartitionKey], offset: Offset) {
        let mut positions = self.positions.borrow_mut();
        for partition in partitions {
            positions.insert(partition.clone(), offset);
        }
    }
}

impl PartitionSeeker for AssignmentSeeker {
    fn seek(&self, partition: &PartitionKey, offset: OffsetMarker) -> Result<(), BrokerError> {
        self.record(std::slice::from_ref(partition), Offset::Offset(offset.value()));
        Ok(())
    }

    fn seek_to_beginning(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        self.record(partitions, Offset::Beginning);
        Ok(())
    }

    fn seek_to_end(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        self.record(partitions, Offset::End);
        Ok(())
    }
}

/// Partitions being revoked cannot be positioned.
struct NoopSeeker;

impl PartitionSeeker for NoopSeeker {
    fn seek(&self, partition: &PartitionKey, _offset: OffsetMarker) -> Result<(), BrokerError> {
        warn!(%partition, "Ignoring seek on a revoked partition");
        Ok(())
    }

    fn seek_to_beginning(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        warn!("Ignoring seek on {} revoked partitions", partitions.len());
        Ok(())
    }

    fn seek_to_end(&self, partitions: &[PartitionKey]) -> Result<(), BrokerError> {
        warn!("Ignoring seek on {} revoked partitions", partitions.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;

    #[derive(Default)]
    struct FixedListener {
        events: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RebalanceListener for FixedListener {
        fn on_rebalance(
            &self,
            event: RebalanceEvent<'_>,
            seeker: &dyn PartitionSeeker,
        ) -> Result<(), SourceError> {
            self.events.lock().unwrap().push(event.name().to_string());
            if self.fail {
                return Err(SourceError::Broker(BrokerError::Client("boom".to_string())));
            }
            if let RebalanceEvent::Assigned(partitions) = event {
                seeker.seek(&partitions[0], OffsetMarker::new(42).unwrap())?;
                seeker.seek_to_end(&partitions[1..])?;
            }
            Ok(())
        }
    }

    fn assignment() -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        list.add_partition("hub", 0);
        list.add_partition("hub", 1);
        list.add_partition("hub", 2);
        list
    }

    #[test]
    fn test_assignment_offsets_follow_listener_seeks() {
        let context = SourceConsumerContext::new();
        let listener = FixedListener::default();
        let tpl = assignment();

        context.assign(&listener, &tpl);

        assert_eq!(
            tpl.find_partition("hub", 0).unwrap().offset(),
            Offset::Offset(42)
        );
        assert_eq!(tpl.find_partition("hub", 1).unwrap().offset(), Offset::End);
        assert_eq!(tpl.find_partition("hub", 2).unwrap().offset(), Offset::End);
        assert!(context.take_deferred_error().is_none());
    }

    #[test]
    fn test_listener_failure_is_parked_for_the_next_poll() {
        let context = SourceConsumerContext::new();
        let listener = FixedListener {
            fail: true,
            ..Default::default()
        };
        let tpl = assignment();

        context.assign(&listener, &tpl);

        assert!(matches!(
            context.take_deferred_error(),
            Some(BrokerError::Rebalance(_))
        ));
        assert!(context.take_deferred_error().is_none());
    }

    #[test]
    fn test_revocation_reaches_listener() {
        let context = SourceConsumerContext::new();
        let listener = FixedListener::default();

        context.revoke(&listener, &assignment());

        assert_eq!(*listener.events.lock().unwrap(), vec!["revoked".to_string()]);
        assert!(context.take_deferred_error().is_none());
    }

    #[test]
    fn test_listener_can_only_be_installed_once() {
        let context = SourceConsumerContext::new();

        assert!(context
            .install_listener(Arc::new(FixedListener::default()))
            .is_ok());
        assert!(matches!(
            context.install_listener(Arc::new(FixedListener::default())),
            Err(BrokerError::AlreadySubscribed)
        ));
    }
}
