use std::any::type_name;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::SchemaCodec;
use crate::error::{FlushError, RegistrationError};
use crate::record::{CommitSet, DecodedBatch, RawRecord, TopicKey};

pub const DEFAULT_MAX_BATCH_SIZE: usize = 1;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// What to listen to, and how records are batched before reaching the handler.
#[derive(Debug, Clone)]
pub struct Listen {
    topic: String,
    key: Option<String>,
    max_batch_size: usize,
    window: Duration,
}

impl Listen {
    pub fn topic(topic: &str) -> Self {
        Listen {
            topic: topic.to_owned(),
            key: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            window: DEFAULT_WINDOW,
        }
    }

    /// Only route records carrying exactly this key. Without it, only unkeyed records match.
    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn topic_key(&self) -> TopicKey {
        TopicKey::new(&self.topic, self.key.as_deref())
    }
}

/// Decodes a whole buffer and hands it to a typed handler.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(
        &self,
        codec: &SchemaCodec,
        records: &[RawRecord],
    ) -> Result<CommitSet, FlushError>;
}

async fn decode<T: DeserializeOwned>(
    codec: &SchemaCodec,
    records: &[RawRecord],
) -> Result<DecodedBatch<T>, FlushError> {
    codec
        .decode_batch::<T>(records)
        .await
        .map_err(|(index, error)| {
            let record = &records[index];
            FlushError::Deserialization {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                error,
            }
        })
}

struct EachDelivery<T, F> {
    handler: F,
    _target: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> Delivery for EachDelivery<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn deliver(
        &self,
        codec: &SchemaCodec,
        records: &[RawRecord],
    ) -> Result<CommitSet, FlushError> {
        let batch = decode::<T>(codec, records).await?;
        let skipped = batch.len().saturating_sub(1);
        let (items, offsets) = batch.into_parts();
        if let Some(first) = items.into_iter().next() {
            if skipped > 0 {
                debug!(skipped, "single record handler only receives the head of the buffer");
            }
            (self.handler)(first)
                .await
                .map_err(FlushError::Processing)?;
        }
        Ok(offsets)
    }
}

struct BatchDelivery<T, F> {
    handler: F,
    _target: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> Delivery for BatchDelivery<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn deliver(
        &self,
        codec: &SchemaCodec,
        records: &[RawRecord],
    ) -> Result<CommitSet, FlushError> {
        let batch = decode::<T>(codec, records).await?;
        if batch.is_empty() {
            return Ok(CommitSet::new());
        }
        let (items, offsets) = batch.into_parts();
        (self.handler)(items)
            .await
            .map_err(FlushError::Processing)?;
        Ok(offsets)
    }
}

/// Everything a batch window needs to know about its subscription.
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub topic_key: TopicKey,
    pub max_batch_size: usize,
    pub window: Duration,
    pub is_batch: bool,
    pub target_type: &'static str,
    pub delivery: Arc<dyn Delivery>,
}

/// A registered subscription and the queue the dispatcher feeds it through.
pub struct Subscription {
    config: SubscriptionConfig,
    sender: mpsc::UnboundedSender<RawRecord>,
    receiver: mpsc::UnboundedReceiver<RawRecord>,
}

impl Subscription {
    fn new(config: SubscriptionConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Subscription {
            config,
            sender,
            receiver,
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<RawRecord> {
        self.sender.clone()
    }

    pub fn into_parts(self) -> (SubscriptionConfig, mpsc::UnboundedReceiver<RawRecord>) {
        (self.config, self.receiver)
    }
}

/// Declarative `(topic, key) -> handler` table, filled before the broker starts.
///
/// The broker takes ownership of the registry when it is built, so nothing can
/// subscribe once consumption is running.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: BTreeMap<TopicKey, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a handler receiving one decoded record per flush.
    pub fn register<T, F, Fut>(&mut self, listen: Listen, handler: F) -> Result<(), RegistrationError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let delivery = EachDelivery {
            handler,
            _target: PhantomData,
        };
        self.insert(listen, false, type_name::<T>(), Arc::new(delivery))
    }

    /// Subscribes a handler receiving the whole decoded buffer, in arrival order.
    pub fn register_batch<T, F, Fut>(
        &mut self,
        listen: Listen,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let delivery = BatchDelivery {
            handler,
            _target: PhantomData,
        };
        self.insert(listen, true, type_name::<T>(), Arc::new(delivery))
    }

    fn insert(
        &mut self,
        listen: Listen,
        is_batch: bool,
        target_type: &'static str,
        delivery: Arc<dyn Delivery>,
    ) -> Result<(), RegistrationError> {
        let topic_key = listen.topic_key();
        if listen.max_batch_size == 0 {
            return Err(RegistrationError::ZeroBatchSize(topic_key.to_string()));
        }
        if listen.window.is_zero() {
            return Err(RegistrationError::ZeroWindow(topic_key.to_string()));
        }

        let config = SubscriptionConfig {
            topic_key: topic_key.clone(),
            max_batch_size: listen.max_batch_size,
            window: listen.window,
            is_batch,
            target_type,
            delivery,
        };
        // Last registration wins
        let replaced = self
            .subscriptions
            .insert(topic_key, Subscription::new(config));
        if let Some(previous) = replaced {
            warn!(
                subscription = %previous.config.topic_key,
                replaced_type = previous.config.target_type,
                new_type = target_type,
                "handler registration replaced an earlier one"
            );
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn get(&self, topic_key: &TopicKey) -> Option<&SubscriptionConfig> {
        self.subscriptions.get(topic_key).map(|subscription| &subscription.config)
    }

    /// Union of the registered topics, for the consumer subscription.
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions
            .keys()
            .map(|topic_key| topic_key.topic.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Queue senders by routing key, for the dispatcher.
    pub fn routes(&self) -> HashMap<TopicKey, mpsc::UnboundedSender<RawRecord>> {
        self.subscriptions
            .iter()
            .map(|(topic_key, subscription)| (topic_key.clone(), subscription.sender()))
            .collect()
    }

    pub fn into_subscriptions(self) -> impl Iterator<Item = Subscription> {
        self.subscriptions.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Deserialize)]
    struct Project {
        #[allow(dead_code)]
        name: String,
    }

    #[test]
    fn defaults_to_single_record_one_second_windows() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .register(Listen::topic("projects"), |_: Project| async { Ok(()) })
            .unwrap();

        let config = registry.get(&TopicKey::new("projects", None)).unwrap();
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.window, Duration::from_secs(1));
        assert!(!config.is_batch);
        assert!(config.target_type.ends_with("Project"));
    }

    #[test]
    fn batch_handlers_are_flagged() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .register_batch(
                Listen::topic("projects")
                    .key("create")
                    .max_batch_size(10)
                    .window(Duration::from_millis(500)),
                |_: Vec<Project>| async { Ok(()) },
            )
            .unwrap();

        let config = registry
            .get(&TopicKey::new("projects", Some("create")))
            .unwrap();
        assert!(config.is_batch);
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.window, Duration::from_millis(500));
        assert!(registry.get(&TopicKey::new("projects", None)).is_none());
    }

    #[test]
    fn later_registration_replaces_earlier_one() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .register(Listen::topic("projects"), |_: Project| async { Ok(()) })
            .unwrap();
        registry
            .register_batch(
                Listen::topic("projects").max_batch_size(5),
                |_: Vec<Project>| async { Ok(()) },
            )
            .unwrap();

        assert_eq!(registry.len(), 1);
        let config = registry.get(&TopicKey::new("projects", None)).unwrap();
        assert!(config.is_batch);
        assert_eq!(config.max_batch_size, 5);
    }

    #[test]
    fn rejects_empty_batches_and_windows() {
        let mut registry = SubscriptionRegistry::new();

        assert_eq!(
            registry.register(Listen::topic("t").max_batch_size(0), |_: Project| async {
                Ok(())
            }),
            Err(RegistrationError::ZeroBatchSize("t.None".to_string()))
        );
        assert_eq!(
            registry.register(Listen::topic("t").window(Duration::ZERO), |_: Project| async {
                Ok(())
            }),
            Err(RegistrationError::ZeroWindow("t.None".to_string()))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn topics_are_deduplicated_across_keys() {
        let mut registry = SubscriptionRegistry::new();
        for key in ["a", "b"] {
            registry
                .register(Listen::topic("projects").key(key), |_: Project| async {
                    Ok(())
                })
                .unwrap();
        }
        registry
            .register(Listen::topic("users"), |_: Project| async { Ok(()) })
            .unwrap();

        assert_eq!(registry.topics(), vec!["projects", "users"]);
        assert_eq!(registry.routes().len(), 3);
    }
}
