use std::collections::HashMap;
use std::time::Duration;

use futures::{Stream, StreamExt};
use rdkafka::error::KafkaError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::HealthHandle;
use crate::metrics::DISPATCH_DROPPED;
use crate::record::{RawRecord, TopicKey};

/// How often the dispatcher reports liveness while the stream is idle.
pub const LIVENESS_TICK: Duration = Duration::from_secs(10);

/// Why the dispatch loop returned without a fatal consumer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    Cancelled,
    StreamEnded,
}

/// Routes every consumed record to the queue of the subscription matching
/// its `(topic, key)`. Records matching nothing are dropped without a commit.
pub struct Dispatcher {
    routes: HashMap<TopicKey, mpsc::UnboundedSender<RawRecord>>,
}

impl Dispatcher {
    pub fn new(routes: HashMap<TopicKey, mpsc::UnboundedSender<RawRecord>>) -> Self {
        Dispatcher { routes }
    }

    /// Enqueues one record, returning whether a live subscription accepted it.
    pub fn route(&self, record: RawRecord) -> bool {
        let topic_key = record.topic_key();
        let Some(queue) = self.routes.get(&topic_key) else {
            debug!(
                topic = %record.topic,
                key = %topic_key.key_label(),
                offset = record.offset,
                "no subscription for record, dropping"
            );
            metrics::counter!(DISPATCH_DROPPED, "reason" => "unrouted").increment(1);
            return false;
        };

        if queue.send(record).is_err() {
            // The window behind this queue terminated, it stays uncommitted
            metrics::counter!(DISPATCH_DROPPED, "reason" => "terminated").increment(1);
            return false;
        }
        true
    }

    /// Consumes `records` until the stream ends, `shutdown` fires, or the
    /// consumer reports an error it cannot recover from.
    pub async fn run<S>(
        &self,
        records: S,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) -> Result<DispatchExit, KafkaError>
    where
        S: Stream<Item = Result<RawRecord, KafkaError>>,
    {
        let mut records = std::pin::pin!(records);
        let mut ticker = tokio::time::interval(LIVENESS_TICK);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("dispatcher shutting down");
                    return Ok(DispatchExit::Cancelled);
                }
                _ = ticker.tick() => {
                    liveness.report_healthy();
                }
                next = records.next() => match next {
                    None => {
                        warn!("consumer stream ended");
                        return Ok(DispatchExit::StreamEnded);
                    }
                    Some(Ok(record)) => {
                        self.route(record);
                    }
                    Some(Err(KafkaError::MessageConsumption(code))) => {
                        warn!("transient consumer error: {}", code);
                    }
                    Some(Err(err)) => {
                        error!("fatal consumer error: {}", err);
                        return Err(err);
                    }
                },
            }
        }
    }
}
