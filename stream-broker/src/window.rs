use std::pin::pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::SchemaCodec;
use crate::commit::OffsetCommitter;
use crate::dispatcher::LIVENESS_TICK;
use crate::error::FlushError;
use crate::health::HealthHandle;
use crate::metrics::{ConsumerMetrics, FLUSH_BATCH_SIZE};
use crate::record::{RawRecord, TopicKey};
use crate::registry::SubscriptionConfig;

/// How a batch window stopped.
#[derive(Debug)]
pub enum WindowExit {
    /// The broker is stopping, the pending buffer was discarded uncommitted.
    Cancelled,
    /// The dispatcher dropped the queue feeding this window.
    QueueClosed,
    /// A flush failed, the subscription stops consuming for the process lifetime.
    Terminated(FlushError),
}

/// Accumulates one subscription's records and flushes them to its handler
/// when the buffer is full or the window elapses, whichever comes first.
///
/// A flush either succeeds completely (every record decoded, handler returned
/// `Ok`, offsets committed) or terminates the window without committing anything.
pub struct BatchWindow {
    subscription: SubscriptionConfig,
    queue: mpsc::UnboundedReceiver<RawRecord>,
    codec: Arc<SchemaCodec>,
    committer: Arc<dyn OffsetCommitter>,
    metrics: Arc<dyn ConsumerMetrics>,
    liveness: HealthHandle,
}

impl BatchWindow {
    pub fn new(
        subscription: SubscriptionConfig,
        queue: mpsc::UnboundedReceiver<RawRecord>,
        codec: Arc<SchemaCodec>,
        committer: Arc<dyn OffsetCommitter>,
        metrics: Arc<dyn ConsumerMetrics>,
        liveness: HealthHandle,
    ) -> Self {
        BatchWindow {
            subscription,
            queue,
            codec,
            committer,
            metrics,
            liveness,
        }
    }

    pub fn topic_key(&self) -> &TopicKey {
        &self.subscription.topic_key
    }

    pub fn liveness(&self) -> &HealthHandle {
        &self.liveness
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> WindowExit {
        let mut buffer: Vec<RawRecord> = Vec::new();
        let mut deadline = Instant::now() + self.subscription.window;
        let mut ticker = interval(LIVENESS_TICK);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    if !buffer.is_empty() {
                        info!(
                            subscription = %self.subscription.topic_key,
                            discarded = buffer.len(),
                            "window cancelled, discarding uncommitted buffer"
                        );
                    }
                    return WindowExit::Cancelled;
                }
                _ = sleep_until(deadline) => {
                    if !buffer.is_empty() {
                        if let Err(err) = self.flush(&buffer).await {
                            return self.terminate(err);
                        }
                        buffer.clear();
                    }
                    deadline = Instant::now() + self.subscription.window;
                }
                received = self.queue.recv() => {
                    let Some(record) = received else {
                        return WindowExit::QueueClosed;
                    };
                    buffer.push(record);
                    if buffer.len() >= self.subscription.max_batch_size {
                        if let Err(err) = self.flush(&buffer).await {
                            return self.terminate(err);
                        }
                        buffer.clear();
                        deadline = Instant::now() + self.subscription.window;
                    }
                }
                _ = ticker.tick() => {
                    self.liveness.report_healthy();
                }
            }
        }
    }

    async fn flush(&self, buffer: &[RawRecord]) -> Result<(), FlushError> {
        let topic_key = &self.subscription.topic_key;
        debug!(subscription = %topic_key, size = buffer.len(), "flushing buffer");
        metrics::histogram!(FLUSH_BATCH_SIZE, "subscription" => topic_key.to_string())
            .record(buffer.len() as f64);

        // The handler has no deadline, keep the window live while it runs
        let mut delivery = pin!(self.deliver_and_commit(buffer));
        let mut ticker = interval_at(Instant::now() + LIVENESS_TICK, LIVENESS_TICK);
        loop {
            tokio::select! {
                biased;

                delivered = &mut delivery => {
                    delivered?;
                    break;
                }
                _ = ticker.tick() => {
                    self.liveness.report_healthy();
                }
            }
        }

        self.metrics.consumed(topic_key, buffer.len() as u64);
        self.liveness.report_healthy();
        Ok(())
    }

    async fn deliver_and_commit(&self, buffer: &[RawRecord]) -> Result<(), FlushError> {
        let offsets = self.subscription.delivery.deliver(&self.codec, buffer).await?;
        self.committer.commit(&offsets).await?;
        Ok(())
    }

    /// Counts the aborted buffer once, under the kind of failure that aborted it.
    fn terminate(&self, err: FlushError) -> WindowExit {
        let topic_key = &self.subscription.topic_key;
        if err.is_deserialization() {
            self.metrics.deserialization_error(topic_key);
        } else {
            self.metrics.processing_error(topic_key);
        }
        error!(
            subscription = %topic_key,
            target = self.subscription.target_type,
            "subscription stops consuming: {}",
            err
        );
        WindowExit::Terminated(err)
    }
}
