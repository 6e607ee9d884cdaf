use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::record::TopicKey;

pub const CONSUMER_OBJECTS: &str = "consumer_objects";
pub const PRODUCER_OBJECTS: &str = "producer_objects";
pub const DATABASE_OBJECTS: &str = "database_objects";
pub const SUBSCRIPTIONS_TERMINATED: &str = "stream_broker_subscriptions_terminated_total";
pub const FLUSH_BATCH_SIZE: &str = "stream_broker_flush_batch_size";
pub const DISPATCH_DROPPED: &str = "stream_broker_dispatch_dropped_total";

/// Counter label suffixes, rendered as `{topic}.{key}.{kind}` or `{entity}.{kind}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Total,
    DeserializationError,
    ProcessingError,
    ProducingError,
    TotalCreated,
    ErrorCreation,
}

impl CounterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Total => "total",
            CounterKind::DeserializationError => "deserialization_error",
            CounterKind::ProcessingError => "processing_error",
            CounterKind::ProducingError => "producing_error",
            CounterKind::TotalCreated => "total_created",
            CounterKind::ErrorCreation => "error_creation",
        }
    }
}

pub fn topic_label(topic_key: &TopicKey, kind: CounterKind) -> String {
    format!("{}.{}", topic_key, kind.as_str())
}

pub fn entity_label(entity: &str, kind: CounterKind) -> String {
    format!("{}.{}", entity, kind.as_str())
}

/// Where consumption, production and handler side-effect counts are reported.
pub trait ConsumerMetrics: Send + Sync {
    fn consumed(&self, topic_key: &TopicKey, count: u64);
    fn deserialization_error(&self, topic_key: &TopicKey);
    fn processing_error(&self, topic_key: &TopicKey);
    fn produced(&self, topic_key: &TopicKey);
    fn production_error(&self, topic_key: &TopicKey);
    fn entity_created(&self, entity: &str);
    fn entity_creation_error(&self, entity: &str);
}

/// Reports through the global `metrics` recorder, see `setup_metrics_recorder`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    fn increment(name: &'static str, label: String, count: u64) {
        metrics::counter!(name, "type" => label).increment(count);
    }
}

impl ConsumerMetrics for PrometheusMetrics {
    fn consumed(&self, topic_key: &TopicKey, count: u64) {
        Self::increment(CONSUMER_OBJECTS, topic_label(topic_key, CounterKind::Total), count);
    }

    fn deserialization_error(&self, topic_key: &TopicKey) {
        Self::increment(
            CONSUMER_OBJECTS,
            topic_label(topic_key, CounterKind::DeserializationError),
            1,
        );
    }

    fn processing_error(&self, topic_key: &TopicKey) {
        Self::increment(
            CONSUMER_OBJECTS,
            topic_label(topic_key, CounterKind::ProcessingError),
            1,
        );
    }

    fn produced(&self, topic_key: &TopicKey) {
        Self::increment(PRODUCER_OBJECTS, topic_label(topic_key, CounterKind::Total), 1);
    }

    fn production_error(&self, topic_key: &TopicKey) {
        Self::increment(
            PRODUCER_OBJECTS,
            topic_label(topic_key, CounterKind::ProducingError),
            1,
        );
    }

    fn entity_created(&self, entity: &str) {
        Self::increment(
            DATABASE_OBJECTS,
            entity_label(entity, CounterKind::TotalCreated),
            1,
        );
    }

    fn entity_creation_error(&self, entity: &str) {
        Self::increment(
            DATABASE_OBJECTS,
            entity_label(entity, CounterKind::ErrorCreation),
            1,
        );
    }
}

/// Serves the liveness and metrics routes on `bind` until the listener fails.
pub async fn serve(router: Router, bind: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// `/metrics`, rendering what the installed prometheus recorder collected.
pub fn setup_metrics_router(recorder_handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    )
}

/// Installs the global recorder. Buckets are sized for batch sizes, the only
/// histogram this process records.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    const BATCH_SIZES: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

    PrometheusBuilder::new().set_buckets(BATCH_SIZES)?.install_recorder()
}
