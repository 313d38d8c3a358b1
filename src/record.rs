//! Record types shared by the broker, processor and view, plus the
//! deterministic key partitioner.
//!
//! No I/O happens here.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

/// Header stamped on every changelog record with the input offset that
/// produced it.
pub const SOURCE_OFFSET_HEADER: &str = "source-offset";

/// Fixed SipHash keys for key partitioning.
///
/// Partitioning must agree across processes and restarts, so the hasher is
/// never randomly seeded.
const PARTITION_KEYS: (u64, u64) = (0x5f3c_9a1e_7b2d_4c8e, 0x1d6b_0e4f_a397_c205);

/// Map a key to a partition number in `0..partitions`.
///
/// Every record for a given key lands on the same partition, which gives
/// single-writer semantics per key once partitions have a single owner.
///
/// # Panics
///
/// Panics if `partitions` is zero. Topics are never created with zero
/// partitions.
///
/// # Examples
///
/// ```
/// use streamfold::partition_for;
/// let p = partition_for("user-0", 4);
/// assert!(p < 4);
/// assert_eq!(p, partition_for("user-0", 4)); // deterministic
/// ```
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    assert!(partitions > 0, "topic must have at least one partition");
    let mut hasher = SipHasher13::new_with_keys(PARTITION_KEYS.0, PARTITION_KEYS.1);
    hasher.write(key.as_bytes());
    (hasher.finish() % u64::from(partitions)) as u32
}

/// A `(topic, partition)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition number within the topic.
    pub partition: u32,
}

impl TopicPartition {
    /// Build a `TopicPartition` from a topic name and partition number.
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPosition {
    /// Partition the record was appended to.
    pub partition: u32,
    /// Offset assigned to the record (0-based, dense per partition).
    pub offset: u64,
}

/// An immutable keyed record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Partition the record belongs to.
    pub partition: u32,
    /// Monotonic offset within the partition.
    pub offset: u64,
    /// Record key; determines the partition for keyed appends.
    pub key: String,
    /// Codec-encoded payload.
    pub value: Vec<u8>,
    /// Free-form string headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Append time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl Record {
    /// Returns the input offset recorded in the [`SOURCE_OFFSET_HEADER`]
    /// header, if present and well formed.
    pub fn source_offset(&self) -> Option<u64> {
        self.headers
            .get(SOURCE_OFFSET_HEADER)
            .and_then(|v| v.parse().ok())
    }
}
