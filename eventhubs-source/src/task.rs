use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::config::{Config, SourceSettings};
use crate::controller::ConsumerController;
use crate::error::SourceError;
use crate::kafka::KafkaBrokerClient;
use crate::offsets::{OffsetStorageReader, TopicPartitionOffsetProvider};
use crate::producer::QueuedProducer;
use crate::rebalance::OffsetSeekingRebalanceListener;
use crate::types::SourceRecord;

pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Source task lifecycle: wires the offset provider, rebalance listener,
/// producer and controller together for one EventHub.
pub struct EventHubsSourceTask<C: BrokerClient = KafkaBrokerClient> {
    controller: Option<ConsumerController<C>>,
    close_timeout: Duration,
}

impl EventHubsSourceTask<KafkaBrokerClient> {
    /// Validate `config`, create the Kafka consumer and start polling.
    pub fn start(
        &mut self,
        config: &Config,
        offsets: Arc<dyn OffsetStorageReader>,
    ) -> Result<(), SourceError> {
        if self.controller.is_some() {
            warn!("Source task already started");
            return Ok(());
        }
        let settings = config.validate()?;
        let client = KafkaBrokerClient::from_settings(&settings)?;
        self.start_validated(settings, client, offsets)
    }
}

impl<C: BrokerClient> EventHubsSourceTask<C> {
    pub fn new() -> Self {
        Self {
            controller: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Start with an already created broker client. Configuration is
    /// validated before the client is touched.
    pub fn start_with_client(
        &mut self,
        config: &Config,
        client: C,
        offsets: Arc<dyn OffsetStorageReader>,
    ) -> Result<(), SourceError> {
        if self.controller.is_some() {
            warn!("Source task already started");
            return Ok(());
        }
        let settings = config.validate()?;
        self.start_validated(settings, client, offsets)
    }

    fn start_validated(
        &mut self,
        settings: SourceSettings,
        client: C,
        offsets: Arc<dyn OffsetStorageReader>,
    ) -> Result<(), SourceError> {
        let listener = OffsetSeekingRebalanceListener::new(
            TopicPartitionOffsetProvider::new(offsets),
            settings.seek_mode,
        );
        let (tx, rx) = crossbeam_channel::bounded(settings.queue_capacity);
        let producer = QueuedProducer::new(
            client,
            Arc::new(listener),
            tx,
            settings.topic.clone(),
            settings.client_id.clone(),
        );

        let mut controller = ConsumerController::new(producer, rx, settings.output_topics.clone());
        controller.start()?;

        info!(
            connector = %settings.connector_name,
            client_id = %settings.client_id,
            topic = %settings.topic,
            seek_mode = settings.seek_mode.as_str(),
            output_topics = ?settings.output_topics,
            "Source task started"
        );
        self.close_timeout = settings.close_timeout;
        self.controller = Some(controller);
        Ok(())
    }

    /// Next records, or `None` when nothing arrived within a second.
    pub fn poll(&mut self) -> Result<Option<Vec<SourceRecord>>, SourceError> {
        let Some(controller) = self.controller.as_mut() else {
            return Ok(None);
        };
        let records = controller.poll(POLL_TIMEOUT)?;
        Ok((!records.is_empty()).then_some(records))
    }

    /// Shut the task down within the configured close timeout. Safe before
    /// `start` and after a previous `stop`.
    pub fn stop(&mut self) -> Result<(), SourceError> {
        let Some(mut controller) = self.controller.take() else {
            return Ok(());
        };
        info!(timeout = ?self.close_timeout, "Stopping source task");
        controller.close(self.close_timeout)
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

impl<C: BrokerClient> Default for EventHubsSourceTask<C> {
    fn default() -> Self {
        Self::new()
    }
}
