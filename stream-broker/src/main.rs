use std::sync::Arc;

use axum::{routing::get, Json, Router};
use envconfig::Envconfig;
use serde_json::json;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stream_broker::broker::{Broker, KafkaBroker};
use stream_broker::codec::SchemaCodec;
use stream_broker::config::Config;
use stream_broker::health::HealthRegistry;
use stream_broker::metrics::{
    serve, setup_metrics_recorder, setup_metrics_router, ConsumerMetrics, PrometheusMetrics,
};
use stream_broker::projects;
use stream_broker::registry::SubscriptionRegistry;
use stream_broker::schema_registry::HttpSchemaRegistry;

async fn index() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let recorder_handle = setup_metrics_recorder().expect("failed to install metrics recorder");
    let liveness = HealthRegistry::new("liveness");
    let metrics: Arc<dyn ConsumerMetrics> = Arc::new(PrometheusMetrics);
    let schema_registry = HttpSchemaRegistry::new(
        &config.schema_registry_url,
        config.schema_registry_timeout_ms.0,
    )
    .expect("failed to create schema registry client");
    let codec = Arc::new(SchemaCodec::new(Arc::new(schema_registry)));

    let mut subscriptions = SubscriptionRegistry::new();
    projects::register(&mut subscriptions, &config.project_topic, metrics.clone())
        .expect("failed to register project handler");

    let broker: Arc<dyn Broker> = Arc::new(KafkaBroker::new(
        config.kafka.clone(),
        subscriptions,
        codec,
        metrics,
        liveness.clone(),
        config.subscription_liveness_deadline_ms.0,
    ));
    broker.start().await.expect("failed to start broker");

    let app = Router::new()
        .route("/", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .merge(setup_metrics_router(recorder_handle));

    let bind = config.bind();
    info!("listening on {}", bind);
    tokio::select! {
        served = serve(app, &bind) => {
            if let Err(err) = served {
                error!("http server stopped: {}", err);
            }
        }
        _ = shutdown() => {}
    }

    broker.stop().await;
}
