use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CommitError;
use crate::record::CommitSet;

/// Commits consumed offsets for the consumer group.
///
/// Shared by every batch window, so implementations must accept concurrent calls.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit(&self, offsets: &CommitSet) -> Result<(), CommitError>;
}

/// Commits through the shared rdkafka consumer.
pub struct KafkaCommitter<C: ConsumerContext + 'static> {
    consumer: Arc<StreamConsumer<C>>,
}

impl<C: ConsumerContext + 'static> KafkaCommitter<C> {
    pub fn new(consumer: Arc<StreamConsumer<C>>) -> Self {
        Self { consumer }
    }
}

pub fn partition_list(offsets: &CommitSet) -> Result<TopicPartitionList, rdkafka::error::KafkaError> {
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for ((topic, partition), offset) in offsets {
        list.add_partition_offset(topic, *partition, Offset::Offset(*offset))?;
    }
    Ok(list)
}

#[async_trait]
impl<C: ConsumerContext + 'static> OffsetCommitter for KafkaCommitter<C> {
    async fn commit(&self, offsets: &CommitSet) -> Result<(), CommitError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let consumer = self.consumer.clone();
        let offsets = offsets.clone();
        // A sync commit blocks on the broker round trip, keep it off the runtime threads
        tokio::task::spawn_blocking(move || -> Result<(), CommitError> {
            let list = partition_list(&offsets)?;
            consumer.commit(&list, CommitMode::Sync)?;
            debug!(?offsets, "committed offsets");
            Ok(())
        })
        .await
        .map_err(|_| CommitError::Aborted)?
    }
}

/// Keeps the group's committed offsets from moving backwards.
///
/// Subscriptions on the same topic with different keys read the same
/// partitions, and each window commits the next offset of its own buffer.
/// A window flushing after another one already committed past its records
/// would rewind the partition, so entries at or below the highest committed
/// offset are dropped: the higher commit already covers them.
pub struct MonotonicCommitter {
    inner: Arc<dyn OffsetCommitter>,
    committed: Mutex<HashMap<(String, i32), i64>>,
}

impl MonotonicCommitter {
    pub fn new(inner: Arc<dyn OffsetCommitter>) -> Self {
        MonotonicCommitter {
            inner,
            committed: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl OffsetCommitter for MonotonicCommitter {
    async fn commit(&self, offsets: &CommitSet) -> Result<(), CommitError> {
        // Held across the inner commit so concurrent windows reach the group in mark order
        let mut committed = self.committed.lock().await;
        let advancing: CommitSet = offsets
            .iter()
            .filter(|(partition, offset)| {
                committed
                    .get(*partition)
                    .map_or(true, |highest| **offset > *highest)
            })
            .map(|(partition, offset)| (partition.clone(), *offset))
            .collect();

        if advancing.len() < offsets.len() {
            debug!(
                ?offsets,
                ?advancing,
                "skipping offsets already covered by a later commit"
            );
        }
        if advancing.is_empty() {
            return Ok(());
        }

        self.inner.commit(&advancing).await?;
        committed.extend(advancing);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingCommitter;

    fn offsets(entries: &[(i32, i64)]) -> CommitSet {
        entries
            .iter()
            .map(|(partition, offset)| (("t".to_string(), *partition), *offset))
            .collect()
    }

    #[tokio::test]
    async fn lower_commit_on_shared_partition_is_dropped() {
        let recorded = Arc::new(RecordingCommitter::new());
        let committer = MonotonicCommitter::new(recorded.clone());

        // t.a flushes a@10 first, then t.b flushes the older b@5
        committer.commit(&offsets(&[(0, 11)])).await.unwrap();
        committer.commit(&offsets(&[(0, 6)])).await.unwrap();
        committer.commit(&offsets(&[(0, 11)])).await.unwrap();

        assert_eq!(recorded.commits(), vec![offsets(&[(0, 11)])]);
    }

    #[tokio::test]
    async fn only_advancing_partitions_are_committed() {
        let recorded = Arc::new(RecordingCommitter::new());
        let committer = MonotonicCommitter::new(recorded.clone());

        committer.commit(&offsets(&[(0, 11), (1, 3)])).await.unwrap();
        committer.commit(&offsets(&[(0, 6), (1, 4), (2, 1)])).await.unwrap();

        assert_eq!(
            recorded.commits(),
            vec![offsets(&[(0, 11), (1, 3)]), offsets(&[(1, 4), (2, 1)])]
        );
    }

    #[tokio::test]
    async fn failed_commit_does_not_raise_the_mark() {
        let committer = MonotonicCommitter::new(Arc::new(RecordingCommitter::failing()));

        assert!(committer.commit(&offsets(&[(0, 11)])).await.is_err());
        assert!(committer.committed.lock().await.is_empty());
    }

    #[test]
    fn partition_list_carries_next_offsets() {
        let mut offsets = CommitSet::new();
        offsets.insert(("projects".to_string(), 0), 12);
        offsets.insert(("projects".to_string(), 3), 1);

        let list = partition_list(&offsets).unwrap();

        assert_eq!(list.count(), 2);
        let partition = list.find_partition("projects", 0).unwrap();
        assert_eq!(partition.offset(), Offset::Offset(12));
        let partition = list.find_partition("projects", 3).unwrap();
        assert_eq!(partition.offset(), Offset::Offset(1));
    }
}
