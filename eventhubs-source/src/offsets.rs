use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::OffsetStoreError;
use crate::types::{OffsetMarker, PartitionKey};

/// Read access to the positions the surrounding framework has already made durable.
#[cfg_attr(test, mockall::automock)]
pub trait OffsetStorageReader: Send + Sync {
    fn read(&self, partition: &PartitionKey) -> Result<Option<OffsetMarker>, OffsetStoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetLookup {
    Found(OffsetMarker),
    NotFound,
}

/// Answers "where was this partition left off". No caching and no retries:
/// every call goes to the store and failures are returned to the caller.
#[derive(Clone)]
pub struct TopicPartitionOffsetProvider {
    reader: Arc<dyn OffsetStorageReader>,
}

impl TopicPartitionOffsetProvider {
    pub fn new(reader: Arc<dyn OffsetStorageReader>) -> Self {
        Self { reader }
    }

    pub fn get_offset(&self, partition: &PartitionKey) -> Result<OffsetLookup, OffsetStoreError> {
        let lookup = match self.reader.read(partition)? {
            Some(marker) => OffsetLookup::Found(marker),
            None => OffsetLookup::NotFound,
        };
        debug!(%partition, ?lookup, "offset lookup");
        Ok(lookup)
    }
}

/// Reader used when no offset store is configured: every partition is new.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyOffsetReader;

impl OffsetStorageReader for EmptyOffsetReader {
    fn read(&self, _partition: &PartitionKey) -> Result<Option<OffsetMarker>, OffsetStoreError> {
        Ok(None)
    }
}

#[derive(Deserialize)]
struct StoredOffset {
    connector: String,
    topic: String,
    partition: i32,
    offset: OffsetMarker,
}

/// Reads committed positions from a JSON document maintained by the framework:
///
/// ```json
/// [{"connector": "orders", "topic": "hub", "partition": 0, "offset": 42}]
/// ```
///
/// The file is re-read on every lookup so the latest commit is always seen.
/// Entries are appended as commits happen, so the last matching entry wins.
/// A missing file means nothing was ever committed.
#[derive(Debug, Clone)]
pub struct FileOffsetReader {
    path: PathBuf,
    connector: String,
}

impl FileOffsetReader {
    pub fn new(path: impl AsRef<Path>, connector: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            connector: connector.into(),
        }
    }

    fn load(&self) -> Result<Vec<StoredOffset>, OffsetStoreError> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(OffsetStoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&contents).map_err(|source| OffsetStoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

impl OffsetStorageReader for FileOffsetReader {
    fn read(&self, partition: &PartitionKey) -> Result<Option<OffsetMarker>, OffsetStoreError> {
        let marker = self
            .load()?
            .into_iter()
            .rev()
            .find(|stored| {
                stored.connector == self.connector
                    && stored.topic == partition.topic()
                    && stored.partition == partition.partition()
            })
            .map(|stored| stored.offset);
        Ok(marker)
    }
}
