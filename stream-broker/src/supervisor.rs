use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::health::{ComponentStatus, HealthHandle};
use crate::metrics::{ConsumerMetrics, SUBSCRIPTIONS_TERMINATED};
use crate::record::TopicKey;
use crate::window::{BatchWindow, WindowExit};

/// A subscription that stopped consuming for the rest of the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatedSubscription {
    pub topic_key: TopicKey,
    pub reason: String,
}

/// Shared, append-only list of terminated subscriptions.
#[derive(Debug, Clone, Default)]
pub struct Terminations(Arc<Mutex<Vec<TerminatedSubscription>>>);

impl Terminations {
    pub fn list(&self) -> Vec<TerminatedSubscription> {
        match self.0.lock() {
            Ok(list) => list.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, terminated: TerminatedSubscription) {
        match self.0.lock() {
            Ok(mut list) => list.push(terminated),
            Err(poisoned) => poisoned.into_inner().push(terminated),
        }
    }
}

type WindowOutcome = (TopicKey, HealthHandle, Result<WindowExit, String>);

/// Owns the batch window tasks and makes their terminations observable.
pub struct Supervisor {
    windows: JoinSet<WindowOutcome>,
    metrics: Arc<dyn ConsumerMetrics>,
    terminations: Terminations,
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Supervisor {
    pub fn new(metrics: Arc<dyn ConsumerMetrics>, terminations: Terminations) -> Self {
        Supervisor {
            windows: JoinSet::new(),
            metrics,
            terminations,
        }
    }

    pub fn terminations(&self) -> Terminations {
        self.terminations.clone()
    }

    pub fn spawn(&mut self, window: BatchWindow, shutdown: CancellationToken) {
        let topic_key = window.topic_key().clone();
        let liveness = window.liveness().clone();
        debug!(subscription = %topic_key, "starting batch window");

        self.windows.spawn(async move {
            let exit = AssertUnwindSafe(window.run(shutdown))
                .catch_unwind()
                .await
                .map_err(panic_message);
            (topic_key, liveness, exit)
        });
    }

    /// Waits for every window to exit, recording the ones that terminated.
    pub async fn run(mut self) {
        while let Some(joined) = self.windows.join_next().await {
            let (topic_key, liveness, exit) = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!("batch window task failed: {}", err);
                    continue;
                }
            };

            let reason = match exit {
                Ok(WindowExit::Cancelled) => {
                    debug!(subscription = %topic_key, "batch window stopped");
                    continue;
                }
                Ok(WindowExit::QueueClosed) => {
                    info!(subscription = %topic_key, "dispatcher gone, batch window stopped");
                    continue;
                }
                Ok(WindowExit::Terminated(err)) => err.to_string(),
                Err(panic) => {
                    // The window never got to count the aborted buffer
                    self.metrics.processing_error(&topic_key);
                    format!("handler panicked: {panic}")
                }
            };

            self.terminate(topic_key, &liveness, reason);
        }
    }

    fn terminate(&self, topic_key: TopicKey, liveness: &HealthHandle, reason: String) {
        error!(subscription = %topic_key, "subscription terminated: {}", reason);
        metrics::counter!(SUBSCRIPTIONS_TERMINATED, "subscription" => topic_key.to_string())
            .increment(1);
        liveness.report_status(ComponentStatus::Terminated(reason.clone()));
        self.terminations
            .push(TerminatedSubscription { topic_key, reason });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;
    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::SchemaCodec;
    use crate::health::HealthRegistry;
    use crate::metrics::CounterKind;
    use crate::record::RawRecord;
    use crate::registry::{Listen, SubscriptionRegistry};
    use crate::test_utils::{MemorySchemaRegistry, RecordingCommitter, RecordingMetrics};

    const SCHEMA: &str = r#"{
        "type": "record",
        "name": "Ping",
        "fields": [{"name": "n", "type": "long"}]
    }"#;

    #[derive(Deserialize)]
    struct Ping {
        n: i64,
    }

    struct Running {
        health: HealthRegistry,
        metrics: Arc<RecordingMetrics>,
        terminations: Terminations,
        senders: Vec<mpsc::UnboundedSender<RawRecord>>,
        codec: Arc<SchemaCodec>,
        shutdown: CancellationToken,
        supervisor: tokio::task::JoinHandle<()>,
    }

    async fn start(registry: SubscriptionRegistry) -> Running {
        let schemas = Arc::new(MemorySchemaRegistry::new());
        schemas.register("pings", SCHEMA);
        let codec = Arc::new(SchemaCodec::new(schemas));
        let metrics = Arc::new(RecordingMetrics::new());
        let committer = Arc::new(RecordingCommitter::new());
        let health = HealthRegistry::new("liveness");
        let shutdown = CancellationToken::new();

        let mut supervisor = Supervisor::new(metrics.clone(), Terminations::default());
        let mut senders = Vec::new();
        for subscription in registry.into_subscriptions() {
            senders.push(subscription.sender());
            let (config, queue) = subscription.into_parts();
            let liveness = health
                .register(
                    format!("subscription:{}", config.topic_key),
                    time::Duration::seconds(30),
                );
            let window = BatchWindow::new(
                config,
                queue,
                codec.clone(),
                committer.clone(),
                metrics.clone(),
                liveness,
            );
            supervisor.spawn(window, shutdown.clone());
        }
        let terminations = supervisor.terminations();

        Running {
            health,
            metrics,
            terminations,
            senders,
            codec: codec.clone(),
            shutdown,
            supervisor: tokio::spawn(supervisor.run()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_terminates_its_subscription() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .register(Listen::topic("pings"), |ping: Ping| async move {
                if ping.n > 1 {
                    panic!("cannot handle {}", ping.n);
                }
                Ok(())
            })
            .unwrap();
        let running = start(registry).await;

        #[derive(serde::Serialize)]
        struct Out {
            n: i64,
        }
        let value = running.codec.encode("pings", &Out { n: 2 }).await.unwrap();
        running.senders[0]
            .send(RawRecord {
                topic: "pings".to_string(),
                partition: 0,
                offset: 0,
                key: None,
                value: Some(value),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let terminated = running.terminations.list();
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].topic_key, TopicKey::new("pings", None));
        assert!(terminated[0].reason.contains("cannot handle 2"));
        assert_eq!(
            running
                .metrics
                .consumer(&TopicKey::new("pings", None), CounterKind::ProcessingError),
            1
        );

        let status = running.health.get_status();
        assert!(!status.healthy);
        assert!(matches!(
            status.components.get("subscription:pings.None"),
            Some(ComponentStatus::Terminated(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_subscription_leaves_the_others_running() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .register(Listen::topic("pings").key("bad"), |_: Ping| async {
                Err(anyhow::anyhow!("rejected"))
            })
            .unwrap();
        registry
            .register(Listen::topic("pings").key("good"), |_: Ping| async { Ok(()) })
            .unwrap();
        let running = start(registry).await;

        // Subscriptions are started in key order: "bad" then "good"
        running.senders[0]
            .send(RawRecord {
                topic: "pings".to_string(),
                partition: 0,
                offset: 0,
                key: Some(b"bad".to_vec()),
                value: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let terminated = running.terminations.list();
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].topic_key, TopicKey::new("pings", Some("bad")));
        assert!(running.senders[0].is_closed());
        assert!(!running.senders[1].is_closed());

        running.shutdown.cancel();
        running.supervisor.await.unwrap();
        assert_eq!(running.terminations.list().len(), 1);
    }
}
