use std::sync::Arc;
use std::time::Duration;

use apache_avro::types::Value;
use async_trait::async_trait;
use futures::StreamExt;
use metrics::gauge;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientConfig, ClientContext, Statistics, TopicPartitionList};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, SchemaCodec};
use crate::commit::{KafkaCommitter, MonotonicCommitter, OffsetCommitter};
use crate::config::KafkaConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{BrokerError, ProduceError};
use crate::health::{ComponentStatus, HealthHandle, HealthRegistry};
use crate::metrics::ConsumerMetrics;
use crate::producer::{create_kafka_producer, KafkaTransport, Producer};
use crate::record::RawRecord;
use crate::registry::SubscriptionRegistry;
use crate::supervisor::{Supervisor, TerminatedSubscription, Terminations};
use crate::window::BatchWindow;

/// rdkafka client context shared by the consumer and the producer.
pub struct BrokerContext {
    liveness: HealthHandle,
}

impl BrokerContext {
    pub fn new(liveness: HealthHandle) -> Self {
        BrokerContext { liveness }
    }
}

impl ClientContext for BrokerContext {
    fn stats(&self, stats: Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("stream_broker_kafka_callback_queue_depth", "client" => stats.client_id.clone())
            .set(stats.replyq as f64);
        for (topic, stats) in stats.topics {
            for (partition, stats) in stats.partitions {
                if stats.consumer_lag >= 0 {
                    gauge!(
                        "stream_broker_kafka_consumer_lag",
                        "topic" => topic.clone(),
                        "partition" => partition.to_string()
                    )
                    .set(stats.consumer_lag as f64);
                }
            }
        }
    }
}

impl ConsumerContext for BrokerContext {
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(err) = result {
            warn!(?offsets, "offset commit reported an error: {}", err);
        }
    }
}

/// Creates the group consumer for every registered topic. Offsets are only
/// ever committed explicitly, after a successful flush.
pub fn create_kafka_consumer(
    config: &KafkaConfig,
    topics: &[String],
    context: BrokerContext,
) -> Result<StreamConsumer<BrokerContext>, KafkaError> {
    info!(?topics, "connecting consumer to Kafka brokers at {}...", config.kafka_hosts);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &config.kafka_consumer_group)
        .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka consumer configuration: {:?}", client_config);
    let consumer: StreamConsumer<BrokerContext> = client_config.create_with_context(context)?;
    let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer.subscribe(&topics)?;

    Ok(consumer)
}

/// Lifecycle and production surface of a message broker. Object safe, so the
/// implementation can be picked at runtime behind an `Arc<dyn Broker>`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Starts producing, then consuming for every registered subscription.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Stops consuming, discarding uncommitted buffers, then stops producing.
    async fn stop(&self);

    /// Encodes `message` with the topic's latest schema and waits for delivery.
    async fn produce_value(
        &self,
        topic: &str,
        message: Value,
        key: Option<&str>,
    ) -> Result<(), ProduceError>;

    fn terminated_subscriptions(&self) -> Vec<TerminatedSubscription>;
}

/// Typed production for any `Broker`, trait objects included.
#[async_trait]
pub trait BrokerExt: Broker {
    /// A message serde cannot represent as an avro value fails with
    /// `SchemaMismatch` before it reaches the broker.
    async fn produce<T: Serialize + Sync + ?Sized>(
        &self,
        topic: &str,
        message: &T,
        key: Option<&str>,
    ) -> Result<(), ProduceError> {
        let value = codec::to_value(topic, message)?;
        self.produce_value(topic, value, key).await
    }
}

impl<B: Broker + ?Sized> BrokerExt for B {}

struct ActiveProducer {
    producer: Producer,
    transport: Arc<KafkaTransport>,
}

/// Kafka-backed broker. Owns its codec caches, subscriptions and tasks, so
/// several instances can live in one process without sharing state.
pub struct KafkaBroker {
    config: KafkaConfig,
    codec: Arc<SchemaCodec>,
    metrics: Arc<dyn ConsumerMetrics>,
    health: HealthRegistry,
    liveness_deadline: time::Duration,
    registry: Mutex<Option<SubscriptionRegistry>>,
    producer: RwLock<Option<ActiveProducer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    terminations: Terminations,
}

impl KafkaBroker {
    pub fn new(
        config: KafkaConfig,
        registry: SubscriptionRegistry,
        codec: Arc<SchemaCodec>,
        metrics: Arc<dyn ConsumerMetrics>,
        health: HealthRegistry,
        liveness_deadline: Duration,
    ) -> Self {
        KafkaBroker {
            config,
            codec,
            metrics,
            health,
            liveness_deadline: time::Duration::milliseconds(
                liveness_deadline.as_millis().try_into().unwrap_or(i64::MAX),
            ),
            registry: Mutex::new(Some(registry)),
            producer: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            terminations: Terminations::default(),
        }
    }

    fn liveness(&self, component: String) -> HealthHandle {
        self.health.register(component, self.liveness_deadline)
    }

    fn start_consumer(
        &self,
        consumer: StreamConsumer<BrokerContext>,
        registry: SubscriptionRegistry,
    ) -> Vec<JoinHandle<()>> {
        let consumer = Arc::new(consumer);
        let kafka: Arc<dyn OffsetCommitter> = Arc::new(KafkaCommitter::new(consumer.clone()));
        let committer: Arc<dyn OffsetCommitter> = Arc::new(MonotonicCommitter::new(kafka));
        let dispatcher = Dispatcher::new(registry.routes());

        let mut supervisor = Supervisor::new(self.metrics.clone(), self.terminations.clone());
        for subscription in registry.into_subscriptions() {
            let (config, queue) = subscription.into_parts();
            let liveness = self.liveness(format!("subscription:{}", config.topic_key));
            info!(
                subscription = %config.topic_key,
                target = config.target_type,
                batch = config.is_batch,
                max_batch_size = config.max_batch_size,
                window_ms = config.window.as_millis() as u64,
                "subscribing handler"
            );
            let window = BatchWindow::new(
                config,
                queue,
                self.codec.clone(),
                committer.clone(),
                self.metrics.clone(),
                liveness,
            );
            supervisor.spawn(window, self.shutdown.clone());
        }

        let dispatcher_liveness = self.liveness("dispatcher".to_string());
        let shutdown = self.shutdown.clone();
        let dispatch = tokio::spawn(async move {
            let records = consumer
                .stream()
                .map(|message| message.map(|message| RawRecord::from_message(&message)));
            match dispatcher
                .run(records, shutdown.clone(), dispatcher_liveness.clone())
                .await
            {
                Ok(exit) => info!(?exit, "dispatcher stopped"),
                Err(err) => {
                    error!("dispatcher stopped on consumer error: {}", err);
                    dispatcher_liveness.report_status(ComponentStatus::Unhealthy);
                }
            }
            // Nothing feeds the windows anymore, stop them too
            shutdown.cancel();
        });

        vec![dispatch, tokio::spawn(supervisor.run())]
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        let mut registry = self.registry.lock().await;
        let Some(subscriptions) = registry.as_ref() else {
            return Err(BrokerError::AlreadyStarted);
        };

        // Both clients are created before anything is taken, so a failed start can be retried
        let liveness = self.liveness("producer".to_string());
        let producer = create_kafka_producer(&self.config, liveness)?;
        let consumer = if subscriptions.is_empty() {
            None
        } else {
            let context = BrokerContext::new(self.liveness("consumer".to_string()));
            Some(create_kafka_consumer(
                &self.config,
                &subscriptions.topics(),
                context,
            )?)
        };

        let transport = Arc::new(KafkaTransport::new(producer));
        *self.producer.write().await = Some(ActiveProducer {
            producer: Producer::new(self.codec.clone(), transport.clone(), self.metrics.clone()),
            transport,
        });

        let Some(subscriptions) = registry.take() else {
            return Err(BrokerError::AlreadyStarted);
        };
        match consumer {
            Some(consumer) => {
                let tasks = self.start_consumer(consumer, subscriptions);
                self.tasks.lock().await.extend(tasks);
            }
            None => info!("no subscriptions registered, consumer not started"),
        }
        Ok(())
    }

    async fn stop(&self) {
        info!("stopping broker");
        self.shutdown.cancel();

        // The consumer is closed once the dispatcher and every window released it
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!("broker task failed while stopping: {}", err);
            }
        }

        let active = self.producer.write().await.take();
        if let Some(ActiveProducer { transport, .. }) = active {
            let flushed =
                tokio::task::spawn_blocking(move || transport.flush(Duration::from_secs(30))).await;
            match flushed {
                Ok(Ok(())) => info!("producer flushed"),
                Ok(Err(err)) => warn!("failed to flush producer: {}", err),
                Err(err) => warn!("producer flush task failed: {}", err),
            }
        }
    }

    async fn produce_value(
        &self,
        topic: &str,
        message: Value,
        key: Option<&str>,
    ) -> Result<(), ProduceError> {
        let producer = self
            .producer
            .read()
            .await
            .as_ref()
            .map(|active| active.producer.clone())
            .ok_or(ProduceError::NotStarted)?;
        producer.produce_value(topic, message, key).await
    }

    fn terminated_subscriptions(&self) -> Vec<TerminatedSubscription> {
        self.terminations.list()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use rdkafka::consumer::BaseConsumer;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::Offset;
    use serde::Deserialize;

    use super::*;
    use crate::metrics::CounterKind;
    use crate::record::TopicKey;
    use crate::registry::Listen;
    use crate::test_utils::{MemorySchemaRegistry, RecordingMetrics};

    const GROUP: &str = "stream-broker-test";
    const USER_SCHEMA: &str = r#"{
        "type": "record",
        "name": "User",
        "fields": [{"name": "email", "type": "string"}]
    }"#;

    #[derive(Debug, Serialize, Deserialize)]
    struct User {
        email: String,
    }

    fn user(email: &str) -> User {
        User {
            email: email.to_string(),
        }
    }

    fn kafka_config(hosts: String) -> KafkaConfig {
        KafkaConfig {
            kafka_hosts: hosts,
            kafka_consumer_group: GROUP.to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
        }
    }

    fn broker(
        config: KafkaConfig,
        registry: SubscriptionRegistry,
        metrics: Arc<RecordingMetrics>,
    ) -> KafkaBroker {
        let schemas = Arc::new(MemorySchemaRegistry::new());
        schemas.register("users", USER_SCHEMA);
        KafkaBroker::new(
            config,
            registry,
            Arc::new(SchemaCodec::new(schemas)),
            metrics,
            HealthRegistry::new("liveness"),
            Duration::from_secs(30),
        )
    }

    /// The first sends can time out while the mock cluster elects leaders.
    async fn produce_eventually(broker: &dyn Broker, message: &User, key: Option<&str>) {
        for _ in 0..20 {
            if broker.produce("users", message, key).await.is_ok() {
                return;
            }
        }
        broker
            .produce("users", message, key)
            .await
            .expect("failed to produce");
    }

    #[tokio::test]
    async fn produce_before_start_is_not_started() {
        let metrics = Arc::new(RecordingMetrics::new());
        let broker: Arc<dyn Broker> = Arc::new(broker(
            kafka_config("localhost:1".to_string()),
            SubscriptionRegistry::new(),
            metrics.clone(),
        ));

        let result = broker.produce("users", &user("a@b.c"), None).await;

        assert!(matches!(result, Err(ProduceError::NotStarted)));
        assert_eq!(
            metrics.producer(&TopicKey::new("users", None), CounterKind::ProducingError),
            0
        );
        assert!(broker.terminated_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn produces_once_started_and_refuses_to_start_twice() {
        let cluster: MockCluster<'static, DefaultProducerContext> =
            MockCluster::new(1).expect("failed to create mock brokers");
        let metrics = Arc::new(RecordingMetrics::new());
        let broker = broker(
            kafka_config(cluster.bootstrap_servers()),
            SubscriptionRegistry::new(),
            metrics.clone(),
        );

        broker.start().await.expect("failed to start broker");
        assert!(matches!(
            broker.start().await,
            Err(BrokerError::AlreadyStarted)
        ));

        produce_eventually(&broker, &user("a@b.c"), Some("signup")).await;
        let produced = metrics.producer(&TopicKey::new("users", Some("signup")), CounterKind::Total);
        assert!(produced >= 1);

        broker.stop().await;
        assert!(matches!(
            broker.produce("users", &user("a@b.c"), None).await,
            Err(ProduceError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn failed_consumer_start_keeps_subscriptions_for_a_retry() {
        let cluster: MockCluster<'static, DefaultProducerContext> =
            MockCluster::new(1).expect("failed to create mock brokers");
        let mut registry = SubscriptionRegistry::new();
        registry
            .register(Listen::topic("users"), |_: User| async { Ok(()) })
            .unwrap();
        let mut config = kafka_config(cluster.bootstrap_servers());
        config.kafka_consumer_offset_reset = "sideways".to_string();
        let broker = broker(config, registry, Arc::new(RecordingMetrics::new()));

        assert!(matches!(broker.start().await, Err(BrokerError::Kafka(_))));
        // Still not started: the subscriptions were kept and nothing half-started
        assert!(matches!(broker.start().await, Err(BrokerError::Kafka(_))));
        assert!(broker.registry.lock().await.is_some());
        assert!(matches!(
            broker.produce("users", &user("a@b.c"), None).await,
            Err(ProduceError::NotStarted)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consumes_and_commits_produced_records() {
        let cluster: MockCluster<'static, DefaultProducerContext> =
            MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("users", 1, 1)
            .expect("failed to create topic");

        let received: Arc<StdMutex<Vec<String>>> = Default::default();
        let handler_received = received.clone();
        let mut registry = SubscriptionRegistry::new();
        registry
            .register_batch(
                Listen::topic("users")
                    .max_batch_size(5)
                    .window(Duration::from_millis(200)),
                move |users: Vec<User>| {
                    let received = handler_received.clone();
                    async move {
                        received
                            .lock()
                            .unwrap()
                            .extend(users.into_iter().map(|user| user.email));
                        Ok(())
                    }
                },
            )
            .unwrap();
        let metrics = Arc::new(RecordingMetrics::new());
        let hosts = cluster.bootstrap_servers();
        let broker = broker(kafka_config(hosts.clone()), registry, metrics.clone());
        broker.start().await.expect("failed to start broker");

        for n in 0..5 {
            produce_eventually(&broker, &user(&format!("user-{n}")), None).await;
        }

        // Consumed is only counted once the flush committed
        let unkeyed = TopicKey::new("users", None);
        for _ in 0..300 {
            if metrics.consumer(&unkeyed, CounterKind::Total) >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(metrics.consumer(&unkeyed, CounterKind::Total), 5);
        assert_eq!(
            *received.lock().unwrap(),
            (0..5).map(|n| format!("user-{n}")).collect::<Vec<_>>()
        );
        assert!(broker.terminated_subscriptions().is_empty());
        broker.stop().await;

        let reader: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &hosts)
            .set("group.id", GROUP)
            .create()
            .expect("failed to create offset reader");
        let mut partitions = TopicPartitionList::new();
        partitions.add_partition("users", 0);
        let committed = reader
            .committed_offsets(partitions, Duration::from_secs(10))
            .expect("failed to fetch committed offsets");
        assert_eq!(
            committed.find_partition("users", 0).unwrap().offset(),
            Offset::Offset(5)
        );
    }
}
