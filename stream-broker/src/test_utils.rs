//! In-memory stand-ins for the broker's remote collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::commit::OffsetCommitter;
use crate::error::{CommitError, ProduceError, RegistryError};
use crate::metrics::{
    entity_label, topic_label, ConsumerMetrics, CounterKind, CONSUMER_OBJECTS, DATABASE_OBJECTS,
    PRODUCER_OBJECTS,
};
use crate::producer::Transport;
use crate::record::{CommitSet, TopicKey};
use crate::schema_registry::{RegisteredSchema, SchemaRegistry};

#[derive(Default)]
struct MemorySchemas {
    next_id: u32,
    by_id: HashMap<u32, String>,
    latest: HashMap<String, RegisteredSchema>,
}

/// Schema registry keeping every registered version in memory.
///
/// Each `register` call allocates a fresh id and becomes the subject's latest version.
#[derive(Default)]
pub struct MemorySchemaRegistry {
    schemas: Mutex<MemorySchemas>,
    latest_lookups: AtomicUsize,
}

impl MemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subject: &str, schema: &str) -> u32 {
        let mut schemas = self.schemas.lock().unwrap();
        schemas.next_id += 1;
        let id = schemas.next_id;
        let version = schemas
            .latest
            .get(subject)
            .and_then(|registered| registered.version)
            .unwrap_or(0)
            + 1;

        schemas.by_id.insert(id, schema.to_owned());
        schemas.latest.insert(
            subject.to_owned(),
            RegisteredSchema {
                id,
                version: Some(version),
                schema: schema.to_owned(),
            },
        );
        id
    }

    /// Number of "latest version" lookups served so far.
    pub fn latest_lookups(&self) -> usize {
        self.latest_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaRegistry for MemorySchemaRegistry {
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, RegistryError> {
        self.latest_lookups.fetch_add(1, Ordering::SeqCst);
        let schemas = self.schemas.lock().unwrap();
        schemas
            .latest
            .get(subject)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("subject {subject}")))
    }

    async fn by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError> {
        let schemas = self.schemas.lock().unwrap();
        schemas
            .by_id
            .get(&id)
            .map(|schema| RegisteredSchema {
                id,
                version: None,
                schema: schema.clone(),
            })
            .ok_or_else(|| RegistryError::NotFound(format!("schema id {id}")))
    }
}

/// Keeps every commit request, optionally failing all of them.
#[derive(Default)]
pub struct RecordingCommitter {
    commits: Mutex<Vec<CommitSet>>,
    fail: AtomicBool,
}

impl RecordingCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let committer = Self::default();
        committer.fail.store(true, Ordering::SeqCst);
        committer
    }

    pub fn commits(&self) -> Vec<CommitSet> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl OffsetCommitter for RecordingCommitter {
    async fn commit(&self, offsets: &CommitSet) -> Result<(), CommitError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CommitError::Aborted);
        }
        self.commits.lock().unwrap().push(offsets.clone());
        Ok(())
    }
}

/// Counter values by metric name and label.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<(&'static str, String), u64>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str, label: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .find(|((metric, key), _)| *metric == name && key == label)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn consumer(&self, topic_key: &TopicKey, kind: CounterKind) -> u64 {
        self.count(CONSUMER_OBJECTS, &topic_label(topic_key, kind))
    }

    pub fn producer(&self, topic_key: &TopicKey, kind: CounterKind) -> u64 {
        self.count(PRODUCER_OBJECTS, &topic_label(topic_key, kind))
    }

    fn increment(&self, name: &'static str, label: String, count: u64) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry((name, label))
            .or_default() += count;
    }
}

impl ConsumerMetrics for RecordingMetrics {
    fn consumed(&self, topic_key: &TopicKey, count: u64) {
        self.increment(CONSUMER_OBJECTS, topic_label(topic_key, CounterKind::Total), count);
    }

    fn deserialization_error(&self, topic_key: &TopicKey) {
        self.increment(
            CONSUMER_OBJECTS,
            topic_label(topic_key, CounterKind::DeserializationError),
            1,
        );
    }

    fn processing_error(&self, topic_key: &TopicKey) {
        self.increment(
            CONSUMER_OBJECTS,
            topic_label(topic_key, CounterKind::ProcessingError),
            1,
        );
    }

    fn produced(&self, topic_key: &TopicKey) {
        self.increment(PRODUCER_OBJECTS, topic_label(topic_key, CounterKind::Total), 1);
    }

    fn production_error(&self, topic_key: &TopicKey) {
        self.increment(
            PRODUCER_OBJECTS,
            topic_label(topic_key, CounterKind::ProducingError),
            1,
        );
    }

    fn entity_created(&self, entity: &str) {
        self.increment(DATABASE_OBJECTS, entity_label(entity, CounterKind::TotalCreated), 1);
    }

    fn entity_creation_error(&self, entity: &str) {
        self.increment(DATABASE_OBJECTS, entity_label(entity, CounterKind::ErrorCreation), 1);
    }
}

/// A message handed to a `RecordingTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Producer transport keeping sent messages instead of talking to kafka.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every following send is canceled, as if delivery timed out.
    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), ProduceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProduceError::Canceled);
        }
        self.sent.lock().unwrap().push(SentMessage {
            topic: topic.to_owned(),
            key: key.map(str::to_owned),
            payload,
        });
        Ok(())
    }
}
