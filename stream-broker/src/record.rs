use std::collections::BTreeMap;
use std::fmt;

use rdkafka::Message;

/// Routing identity of a subscription: a topic, optionally narrowed to one message key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey {
    pub topic: String,
    pub key: Option<Vec<u8>>,
}

impl TopicKey {
    pub fn new(topic: &str, key: Option<&str>) -> Self {
        Self::from_bytes(topic, key.map(str::as_bytes))
    }

    pub fn from_bytes(topic: &str, key: Option<&[u8]>) -> Self {
        TopicKey {
            topic: topic.to_owned(),
            key: key.map(<[u8]>::to_vec),
        }
    }

    /// Key as rendered in metric labels and logs, `None` when the subscription has no key.
    pub fn key_label(&self) -> String {
        match &self.key {
            Some(key) => String::from_utf8_lossy(key).into_owned(),
            None => "None".to_string(),
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.topic, self.key_label())
    }
}

/// A record exactly as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

impl RawRecord {
    pub fn from_message<M: Message>(message: &M) -> Self {
        RawRecord {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
        }
    }

    pub fn topic_key(&self) -> TopicKey {
        TopicKey::from_bytes(&self.topic, self.key.as_deref())
    }
}

/// Offsets to commit, keyed by (topic, partition). Values are the next offset to read.
pub type CommitSet = BTreeMap<(String, i32), i64>;

/// Builds the commit set for a buffer: per partition, the highest offset seen plus one.
pub fn commit_set(records: &[RawRecord]) -> CommitSet {
    let mut offsets = CommitSet::new();
    for record in records {
        let next = record.offset + 1;
        offsets
            .entry((record.topic.clone(), record.partition))
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }
    offsets
}

/// A fully decoded buffer. Only ever built when every record decoded.
#[derive(Debug)]
pub struct DecodedBatch<T> {
    items: Vec<T>,
    offsets: CommitSet,
}

impl<T> DecodedBatch<T> {
    pub fn new(items: Vec<T>, offsets: CommitSet) -> Self {
        DecodedBatch { items, offsets }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn offsets(&self) -> &CommitSet {
        &self.offsets
    }

    pub fn into_parts(self) -> (Vec<T>, CommitSet) {
        (self.items, self.offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: i32, offset: i64) -> RawRecord {
        RawRecord {
            topic: "t".to_string(),
            partition,
            offset,
            key: None,
            value: None,
        }
    }

    #[test]
    fn commit_set_uses_highest_offset_per_partition() {
        let buffer = vec![record(0, 4), record(1, 10), record(0, 7), record(0, 5)];

        let offsets = commit_set(&buffer);

        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets.get(&("t".to_string(), 0)), Some(&8));
        assert_eq!(offsets.get(&("t".to_string(), 1)), Some(&11));
    }

    #[test]
    fn commit_set_is_empty_for_empty_buffer() {
        assert!(commit_set(&[]).is_empty());
    }

    #[test]
    fn topic_key_matches_record_key_bytes() {
        let mut raw = record(0, 0);
        raw.key = Some(b"project".to_vec());

        assert_eq!(raw.topic_key(), TopicKey::new("t", Some("project")));
        assert_ne!(raw.topic_key(), TopicKey::new("t", None));
    }

    #[test]
    fn topic_key_display_renders_missing_key() {
        assert_eq!(TopicKey::new("t", None).to_string(), "t.None");
        assert_eq!(TopicKey::new("t", Some("k")).to_string(), "t.k");
    }
}
