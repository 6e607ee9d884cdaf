use std::sync::Arc;
use std::time::Duration;

use apache_avro::types::Value;
use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::broker::BrokerContext;
use crate::codec::{self, SchemaCodec};
use crate::config::KafkaConfig;
use crate::error::ProduceError;
use crate::health::HealthHandle;
use crate::metrics::ConsumerMetrics;
use crate::record::TopicKey;

/// Hands encoded payloads to kafka and waits for the delivery report.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), ProduceError>;
}

pub fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<BrokerContext>, KafkaError> {
    info!("connecting producer to Kafka brokers at {}...", config.kafka_hosts);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("compression.codec", &config.kafka_compression_codec)
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: FutureProducer<BrokerContext> =
        client_config.create_with_context(BrokerContext::new(liveness))?;

    // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
    drop(producer.client().fetch_metadata(
        Some("__consumer_offsets"),
        Timeout::After(Duration::new(10, 0)),
    )?);
    info!("producer connected to Kafka brokers");

    Ok(producer)
}

pub struct KafkaTransport {
    producer: FutureProducer<BrokerContext>,
}

impl KafkaTransport {
    pub fn new(producer: FutureProducer<BrokerContext>) -> Self {
        KafkaTransport { producer }
    }

    /// Waits for in-flight deliveries, used on shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), ProduceError> {
        let delivery = self
            .producer
            .send_result(FutureRecord {
                topic,
                payload: Some(&payload),
                partition: None,
                key,
                timestamp: None,
                headers: None,
            })
            .map_err(|(err, _)| err)?;

        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(ProduceError::Canceled),
            Ok(Err((err, _))) => Err(ProduceError::Kafka(err)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// Encodes messages with the topic's latest schema and sends them, one at a time.
///
/// Every failure is returned to the caller; nothing is retried or queued here.
#[derive(Clone)]
pub struct Producer {
    codec: Arc<SchemaCodec>,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn ConsumerMetrics>,
}

impl Producer {
    pub fn new(
        codec: Arc<SchemaCodec>,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn ConsumerMetrics>,
    ) -> Self {
        Producer {
            codec,
            transport,
            metrics,
        }
    }

    pub async fn produce<T: Serialize + Sync + ?Sized>(
        &self,
        topic: &str,
        message: &T,
        key: Option<&str>,
    ) -> Result<(), ProduceError> {
        let result = match codec::to_value(topic, message) {
            Ok(value) => self.encode_and_send(topic, value, key).await,
            Err(err) => Err(err),
        };
        self.record(topic, key, result)
    }

    /// Same as `produce`, for a message already converted to an avro value.
    pub async fn produce_value(
        &self,
        topic: &str,
        value: Value,
        key: Option<&str>,
    ) -> Result<(), ProduceError> {
        let result = self.encode_and_send(topic, value, key).await;
        self.record(topic, key, result)
    }

    fn record(
        &self,
        topic: &str,
        key: Option<&str>,
        result: Result<(), ProduceError>,
    ) -> Result<(), ProduceError> {
        let topic_key = TopicKey::new(topic, key);
        match &result {
            Ok(()) => self.metrics.produced(&topic_key),
            Err(err) => {
                error!(%topic_key, "failed to produce message: {}", err);
                self.metrics.production_error(&topic_key);
            }
        }
        result
    }

    async fn encode_and_send(
        &self,
        topic: &str,
        value: Value,
        key: Option<&str>,
    ) -> Result<(), ProduceError> {
        let payload = self.codec.encode_value(topic, value).await?;
        self.transport.send(topic, key, payload).await
    }
}
