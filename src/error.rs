//! Crate-level error types for the log substrate, state stores, codecs and
//! the components built on them.

use crate::record::TopicPartition;

/// Error returned when encoding or decoding a value fails.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The bytes are not a valid representation of the expected type.
    ///
    /// Consumers treat this as a poison record; see
    /// [`PoisonPolicy`](crate::PoisonPolicy).
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Error returned by a [`StateStore`](crate::StateStore) shard.
///
/// Any store failure is fatal to the ownership of the partition the shard
/// belongs to.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Disk I/O failure while loading or persisting a snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store rejected a write.
    #[error("write rejected for key {key:?}: {reason}")]
    WriteRejected {
        /// Key being written.
        key: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// A stored value could not be decoded into the table's value type.
    #[error("corrupt value for key {key:?}: {source}")]
    Corrupt {
        /// Key whose value is corrupt.
        key: String,
        /// Underlying decode failure.
        #[source]
        source: CodecError,
    },
}

/// Error returned by the log substrate.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The topic has not been created.
    #[error("unknown topic {0:?}")]
    UnknownTopic(String),

    /// The partition does not exist in the topic.
    #[error("unknown partition {0}")]
    UnknownPartition(TopicPartition),

    /// A topic was re-declared with a different partition count.
    #[error("topic {topic:?} has {existing} partitions, requested {requested}")]
    PartitionCountMismatch {
        /// Topic name.
        topic: String,
        /// Partition count already on record.
        existing: u32,
        /// Partition count requested by the caller.
        requested: u32,
    },

    /// The caller's ownership lease is no longer current; another owner may
    /// be writing to the partition.
    #[error("lease for {partition} in group {group:?} is fenced (epoch {epoch})")]
    Fenced {
        /// Consumer group the lease belongs to.
        group: String,
        /// Partition the lease covered.
        partition: TopicPartition,
        /// Epoch carried by the stale lease.
        epoch: u64,
    },

    /// The partition was revoked from this member before it could be acquired.
    #[error("partition {partition} revoked from member {member}")]
    Revoked {
        /// Partition number.
        partition: u32,
        /// Member the partition was revoked from.
        member: String,
    },

    /// The member has left its group.
    #[error("member {0} is not part of the group")]
    NotMember(String),

    /// Disk I/O failure in a file-backed broker. Retryable.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted log segment could not be parsed.
    #[error("corrupt log segment {path}: {reason}")]
    CorruptSegment {
        /// Segment file path.
        path: String,
        /// Parse failure.
        reason: String,
    },
}

impl LogError {
    /// Returns `true` for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::Io(_))
    }

    /// Returns `true` when the error means the caller lost partition
    /// ownership rather than hit a hard failure.
    pub fn is_ownership_loss(&self) -> bool {
        matches!(self, LogError::Fenced { .. } | LogError::Revoked { .. })
    }
}

/// Error that stops a [`Processor`](crate::Processor).
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The local state store failed; the partition entered `Failed`.
    #[error("state store failed on {partition}: {source}")]
    Storage {
        /// Partition whose shard failed.
        partition: TopicPartition,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// The log substrate failed after retries were exhausted.
    #[error("log substrate error: {0}")]
    Log(#[from] LogError),

    /// A poison record was met under [`PoisonPolicy::Fail`](crate::PoisonPolicy::Fail).
    #[error("undecodable record at {partition} offset {offset}: {source}")]
    Poison {
        /// Partition the record was read from.
        partition: TopicPartition,
        /// Offset of the record.
        offset: u64,
        /// Underlying decode failure.
        #[source]
        source: CodecError,
    },

    /// The aggregate produced by the fold could not be encoded.
    #[error("aggregate for key {key:?} could not be encoded: {source}")]
    Encode {
        /// Key of the aggregate.
        key: String,
        /// Underlying codec error.
        #[source]
        source: CodecError,
    },

    /// The builder was missing required settings.
    #[error("invalid processor configuration: {0}")]
    Config(String),

    /// A background task exited unexpectedly.
    #[error("processor task is no longer running: {0}")]
    TaskGone(String),
}

/// Error returned when reading from a [`View`](crate::View).
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    /// The partition owning the key has not finished catching up.
    #[error("partition {0} is still catching up")]
    NotReady(u32),

    /// The local store failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The log substrate failed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// A poison changelog record was met under `PoisonPolicy::Fail`.
    #[error("undecodable changelog record at {partition} offset {offset}: {source}")]
    Poison {
        /// Partition the record was read from.
        partition: TopicPartition,
        /// Offset of the record.
        offset: u64,
        /// Underlying decode failure.
        #[source]
        source: CodecError,
    },

    /// The builder was missing required settings.
    #[error("invalid view configuration: {0}")]
    Config(String),

    /// A background task exited unexpectedly.
    #[error("view task is no longer running: {0}")]
    TaskGone(String),
}

impl From<tokio::task::JoinError> for ProcessError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProcessError::TaskGone(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ViewError {
    fn from(e: tokio::task::JoinError) -> Self {
        ViewError::TaskGone(e.to_string())
    }
}

/// Error returned by an [`Emitter`](crate::Emitter).
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// The value could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The log substrate did not acknowledge the record.
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Error returned when process configuration is invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A numeric setting that must be positive was zero.
    #[error("{name} must be greater than zero")]
    Zero {
        /// Setting name.
        name: &'static str,
    },

    /// A name setting was empty.
    #[error("{name} must not be empty")]
    Empty {
        /// Setting name.
        name: &'static str,
    },

    /// The input and changelog topics would collide.
    #[error("topic {0:?} collides with the changelog topic")]
    TopicCollision(String),
}
