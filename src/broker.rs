//! In-process log substrate: ordered, partitioned, append-only topics with
//! committed offsets and group coordination.
//!
//! A broker is either purely in memory ([`Broker::in_memory`]) or backed by
//! a data directory ([`Broker::open`]), in which case every append is
//! written and synced to a per-partition JSONL segment before it is
//! acknowledged, and committed offsets survive restarts.
//!
//! Writes on behalf of a partition owner ([`Broker::produce_to`],
//! [`Broker::commit`]) carry a [`Lease`] and are rejected once the lease has
//! been superseded.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::LogError;
use crate::group::{GroupCoordinator, Lease, Membership};
use crate::layout::{DataLayout, write_atomic};
use crate::record::{Record, RecordPosition, TopicPartition, partition_for};
use crate::retry::{RetryPolicy, retry_with_backoff};

struct PartitionLog {
    records: RwLock<Vec<Record>>,
    segment: Option<Mutex<File>>,
    /// Next offset to be assigned; readers wait on changes.
    high_watermark: watch::Sender<u64>,
}

impl PartitionLog {
    fn new(records: Vec<Record>, segment: Option<File>) -> Self {
        let (high_watermark, _) = watch::channel(records.len() as u64);
        Self {
            records: RwLock::new(records),
            segment: segment.map(Mutex::new),
            high_watermark,
        }
    }

    fn append(
        &self,
        partition: u32,
        key: &str,
        value: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> io::Result<u64> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = Record {
            partition,
            offset: records.len() as u64,
            key: key.to_string(),
            value: value.to_vec(),
            headers: headers.clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };

        if let Some(segment) = &self.segment {
            let mut line = serde_json::to_vec(&record).map_err(io::Error::other)?;
            line.push(b'\n');
            let mut file = segment
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            append_line(&mut file, &line)?;
        }

        let offset = record.offset;
        records.push(record);
        drop(records);
        self.high_watermark.send_replace(offset + 1);
        Ok(offset)
    }

    fn get(&self, offset: u64) -> Option<Record> {
        let records = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.get(usize::try_from(offset).ok()?).cloned()
    }

    fn len(&self) -> u64 {
        *self.high_watermark.borrow()
    }
}

/// Append one line and sync it. On failure the segment is cut back to its
/// previous length so a retried append never leaves a partial or duplicate
/// line behind.
fn append_line(file: &mut File, line: &[u8]) -> io::Result<()> {
    let start = file.metadata()?.len();
    let written = file.write_all(line).and_then(|()| file.sync_data());
    rollback_on_error(file, start, written)
}

fn rollback_on_error(file: &File, start: u64, result: io::Result<()>) -> io::Result<()> {
    if result.is_err()
        && let Err(e) = file.set_len(start)
    {
        tracing::error!(error = %e, len = start, "failed to roll back segment after a failed append");
    }
    result
}

struct TopicLog {
    name: String,
    partitions: Vec<PartitionLog>,
}

impl TopicLog {
    fn partition(&self, partition: u32) -> Result<&PartitionLog, LogError> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| LogError::UnknownPartition(TopicPartition::new(&self.name, partition)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommittedOffset {
    topic: String,
    partition: u32,
    offset: u64,
}

struct BrokerInner {
    topics: RwLock<HashMap<String, Arc<TopicLog>>>,
    offsets: Mutex<HashMap<String, BTreeMap<TopicPartition, u64>>>,
    /// Serializes commits per group so offset files are written in order.
    commit_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    coordinator: GroupCoordinator,
    layout: Option<DataLayout>,
}

/// Handle to a log substrate.
///
/// `Clone` is cheap: all log state is shared behind an `Arc`. The retry
/// policy belongs to the handle.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("data_dir", &self.inner.layout.as_ref().map(|l| l.base_dir()))
            .finish()
    }
}

impl Broker {
    /// Create a volatile broker. Everything is lost when the last handle
    /// is dropped.
    pub fn in_memory() -> Self {
        Self::from_parts(HashMap::new(), HashMap::new(), None)
    }

    /// Open (or create) a file-backed broker rooted at `data_dir`.
    ///
    /// Existing topics, records and committed offsets are loaded. A torn
    /// final line in a segment (crash mid-append) is truncated away.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] on filesystem failures and
    /// [`LogError::CorruptSegment`] if a segment is damaged anywhere but
    /// its final line.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, LogError> {
        let layout = DataLayout::new(data_dir.as_ref());
        let mut topics = HashMap::new();
        for (name, partitions) in layout.list_topics()? {
            let topic = open_topic(&layout, &name, partitions)?;
            tracing::info!(
                topic = %name,
                partitions,
                records = topic.partitions.iter().map(PartitionLog::len).sum::<u64>(),
                "loaded topic"
            );
            topics.insert(name, Arc::new(topic));
        }
        let offsets = load_offsets(&layout)?;
        Ok(Self::from_parts(topics, offsets, Some(layout)))
    }

    fn from_parts(
        topics: HashMap<String, Arc<TopicLog>>,
        offsets: HashMap<String, BTreeMap<TopicPartition, u64>>,
        layout: Option<DataLayout>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: RwLock::new(topics),
                offsets: Mutex::new(offsets),
                commit_locks: Mutex::new(HashMap::new()),
                coordinator: GroupCoordinator::new(),
                layout,
            }),
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy used by this handle (and its clones) for
    /// appends and commits.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The data layout, when file-backed.
    pub fn layout(&self) -> Option<&DataLayout> {
        self.inner.layout.as_ref()
    }

    /// The group coordinator for this broker.
    pub fn coordinator(&self) -> &GroupCoordinator {
        &self.inner.coordinator
    }

    /// Create a topic with `partitions` partitions.
    ///
    /// Idempotent when the topic already exists with the same partition
    /// count.
    ///
    /// # Errors
    ///
    /// * [`LogError::PartitionCountMismatch`] -- the topic exists with a
    ///   different partition count.
    /// * [`LogError::Io`] -- the topic could not be created on disk.
    pub fn create_topic(&self, name: &str, partitions: u32) -> Result<(), LogError> {
        if partitions == 0 {
            return Err(LogError::PartitionCountMismatch {
                topic: name.to_string(),
                existing: 0,
                requested: 0,
            });
        }
        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = topics.get(name) {
            let existing = existing.partitions.len() as u32;
            if existing != partitions {
                return Err(LogError::PartitionCountMismatch {
                    topic: name.to_string(),
                    existing,
                    requested: partitions,
                });
            }
            return Ok(());
        }

        let topic = match &self.inner.layout {
            Some(layout) => {
                let on_disk = layout.ensure_topic(name, partitions)?;
                if on_disk != partitions {
                    return Err(LogError::PartitionCountMismatch {
                        topic: name.to_string(),
                        existing: on_disk,
                        requested: partitions,
                    });
                }
                open_topic(layout, name, partitions)?
            }
            None => TopicLog {
                name: name.to_string(),
                partitions: (0..partitions)
                    .map(|_| PartitionLog::new(Vec::new(), None))
                    .collect(),
            },
        };
        topics.insert(name.to_string(), Arc::new(topic));
        tracing::info!(topic = name, partitions, "created topic");
        Ok(())
    }

    /// Partition count of `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`] if the topic does not exist.
    pub fn partitions(&self, topic: &str) -> Result<u32, LogError> {
        Ok(self.topic(topic)?.partitions.len() as u32)
    }

    /// All topic names, sorted.
    pub fn topics(&self) -> Vec<String> {
        let topics = self
            .inner
            .topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = topics.keys().cloned().collect();
        names.sort();
        names
    }

    fn topic(&self, topic: &str) -> Result<Arc<TopicLog>, LogError> {
        let topics = self
            .inner
            .topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        topics
            .get(topic)
            .cloned()
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))
    }

    /// Append a keyed record, choosing the partition from the key.
    ///
    /// Returns once the record is durable. Transient failures are retried
    /// according to the broker's [`RetryPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`] for a missing topic, or the last
    /// [`LogError::Io`] once retries are exhausted.
    pub async fn produce(
        &self,
        topic: &str,
        key: &str,
        value: &[u8],
    ) -> Result<RecordPosition, LogError> {
        let log = self.topic(topic)?;
        let partition = partition_for(key, log.partitions.len() as u32);
        let headers = &BTreeMap::new();
        let log = &log;
        let offset = retry_with_backoff(&self.retry, move || async move {
            Ok(log.partition(partition)?.append(partition, key, value, headers)?)
        })
        .await?;
        Ok(RecordPosition { partition, offset })
    }

    /// Append a record to an explicit partition on behalf of a lease holder.
    ///
    /// # Errors
    ///
    /// * [`LogError::Fenced`] -- `lease` is not the current grant for
    ///   `partition`.
    /// * [`LogError::UnknownTopic`] / [`LogError::UnknownPartition`].
    /// * [`LogError::Io`] once retries are exhausted.
    pub async fn produce_to(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        value: &[u8],
        headers: &BTreeMap<String, String>,
        lease: &Lease,
    ) -> Result<RecordPosition, LogError> {
        let log = self.topic(topic)?;
        log.partition(partition)?;
        self.check_fence(topic, partition, lease)?;
        let log = &log;
        let offset = retry_with_backoff(&self.retry, move || async move {
            Ok(log.partition(partition)?.append(partition, key, value, headers)?)
        })
        .await?;
        Ok(RecordPosition { partition, offset })
    }

    fn check_fence(&self, topic: &str, partition: u32, lease: &Lease) -> Result<(), LogError> {
        if lease.partition == partition && self.inner.coordinator.is_current(lease) {
            Ok(())
        } else {
            Err(LogError::Fenced {
                group: lease.group.clone(),
                partition: TopicPartition::new(topic, partition),
                epoch: lease.epoch,
            })
        }
    }

    /// Next offset that will be assigned in the partition.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`] / [`LogError::UnknownPartition`].
    pub fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64, LogError> {
        Ok(self.topic(topic)?.partition(partition)?.len())
    }

    /// Open an ordered reader positioned at `from`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`] / [`LogError::UnknownPartition`].
    pub fn reader(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
    ) -> Result<PartitionReader, LogError> {
        let log = self.topic(topic)?;
        let high_watermark = log.partition(partition)?.high_watermark.subscribe();
        Ok(PartitionReader {
            log,
            partition,
            next: from,
            high_watermark,
        })
    }

    /// Record `offset` as the last processed offset of `tp` for `lease.group`.
    ///
    /// Commits of one group are applied one at a time. On a file-backed
    /// broker the offset becomes visible through [`committed`](Self::committed)
    /// only once the offsets file holding it is on disk.
    ///
    /// # Errors
    ///
    /// * [`LogError::Fenced`] -- `lease` is not current.
    /// * [`LogError::Io`] -- persisting the offsets file failed after retries.
    pub async fn commit(&self, tp: &TopicPartition, offset: u64, lease: &Lease) -> Result<(), LogError> {
        self.check_fence(&tp.topic, tp.partition, lease)?;
        let lock = self.commit_lock(&lease.group);
        let _guard = lock.lock().await;

        let mut snapshot = {
            let offsets = self
                .inner
                .offsets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            offsets.get(&lease.group).cloned().unwrap_or_default()
        };
        snapshot.insert(tp.clone(), offset);

        if let Some(layout) = &self.inner.layout {
            let path = layout.offsets_path(&lease.group);
            let entries: Vec<CommittedOffset> = snapshot
                .iter()
                .map(|(tp, offset)| CommittedOffset {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: *offset,
                })
                .collect();
            let json = serde_json::to_vec_pretty(&entries).map_err(io::Error::other)?;
            let (path, json) = (&path, &json);
            retry_with_backoff(&self.retry, move || async move {
                Ok(write_atomic(path, json)?)
            })
            .await?;
        }

        let mut offsets = self
            .inner
            .offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        offsets
            .entry(lease.group.clone())
            .or_default()
            .insert(tp.clone(), offset);
        Ok(())
    }

    fn commit_lock(&self, group: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .commit_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(group.to_string()).or_default())
    }

    /// Last committed offset of `tp` for `group`, if any.
    pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<u64> {
        let offsets = self
            .inner
            .offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        offsets.get(group)?.get(tp).copied()
    }

    /// Join `group` to share the partitions of `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`] or a partition-count mismatch
    /// with existing members.
    pub fn join_group(&self, group: &str, topic: &str) -> Result<Membership, LogError> {
        let partitions = self.partitions(topic)?;
        self.inner.coordinator.join(group, partitions)
    }
}

/// Ordered reader over one partition.
///
/// Delivery is at-least-once across reader instances: a new reader opened
/// at an earlier offset sees those records again.
pub struct PartitionReader {
    log: Arc<TopicLog>,
    partition: u32,
    next: u64,
    high_watermark: watch::Receiver<u64>,
}

impl PartitionReader {
    /// The offset of the next record this reader will return.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// The partition's current high watermark.
    pub fn high_watermark(&self) -> u64 {
        *self.high_watermark.borrow()
    }

    /// Return the next record if it already exists, without waiting.
    pub fn try_next(&mut self) -> Option<Record> {
        let record = self.log.partitions[self.partition as usize].get(self.next)?;
        self.next += 1;
        Some(record)
    }

    /// Wait for and return the next record.
    ///
    /// Cancel-safe: dropping the future never skips a record.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`] if the topic was torn down.
    pub async fn next(&mut self) -> Result<Record, LogError> {
        loop {
            if let Some(record) = self.try_next() {
                return Ok(record);
            }
            if self.high_watermark.changed().await.is_err() {
                return Err(LogError::UnknownTopic(self.log.name.clone()));
            }
        }
    }
}

fn open_topic(layout: &DataLayout, name: &str, partitions: u32) -> Result<TopicLog, LogError> {
    let mut logs = Vec::with_capacity(partitions as usize);
    for p in 0..partitions {
        let path = layout.segment_path(name, p);
        let records = load_segment(&path, p)?;
        let segment = OpenOptions::new().create(true).append(true).open(&path)?;
        logs.push(PartitionLog::new(records, Some(segment)));
    }
    Ok(TopicLog {
        name: name.to_string(),
        partitions: logs,
    })
}

fn load_segment(path: &Path, partition: u32) -> Result<Vec<Record>, LogError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut valid_len: u64 = 0;
    let mut torn = false;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        if torn {
            return Err(LogError::CorruptSegment {
                path: path.display().to_string(),
                reason: format!("unparseable record before offset {}", records.len()),
            });
        }
        let parsed = line
            .ends_with('\n')
            .then(|| serde_json::from_str::<Record>(line.trim_end()).ok())
            .flatten();
        match parsed {
            Some(record) => {
                if record.offset != records.len() as u64 || record.partition != partition {
                    return Err(LogError::CorruptSegment {
                        path: path.display().to_string(),
                        reason: format!(
                            "expected offset {} in partition {partition}, found offset {} in partition {}",
                            records.len(),
                            record.offset,
                            record.partition
                        ),
                    });
                }
                records.push(record);
                valid_len += read as u64;
            }
            None => torn = true,
        }
    }

    if torn {
        tracing::warn!(
            path = %path.display(),
            valid_records = records.len(),
            "truncating torn segment tail"
        );
        OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
    }
    Ok(records)
}

fn load_offsets(
    layout: &DataLayout,
) -> Result<HashMap<String, BTreeMap<TopicPartition, u64>>, LogError> {
    let dir = layout.base_dir().join("offsets");
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut offsets = HashMap::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(group) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let bytes = fs::read(&path)?;
        match serde_json::from_slice::<Vec<CommittedOffset>>(&bytes) {
            Ok(list) => {
                let map = list
                    .into_iter()
                    .map(|c| (TopicPartition::new(c.topic, c.partition), c.offset))
                    .collect();
                offsets.insert(group, map);
            }
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "corrupt offsets file, ignoring"
            ),
        }
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn broker_with_topic(partitions: u32) -> Broker {
        let broker = Broker::in_memory();
        broker.create_topic("clicks", partitions).expect("create topic");
        broker
    }

    #[tokio::test]
    async fn produce_assigns_dense_offsets_per_partition() {
        let broker = broker_with_topic(1);
        for expected in 0..3 {
            let pos = broker.produce("clicks", "user-0", b"t").await.expect("produce");
            assert_eq!(pos, RecordPosition { partition: 0, offset: expected });
        }
        assert_eq!(broker.high_watermark("clicks", 0).expect("hw"), 3);
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition() {
        let broker = broker_with_topic(4);
        let a = broker.produce("clicks", "user-7", b"1").await.expect("produce");
        let b = broker.produce("clicks", "user-7", b"2").await.expect("produce");
        assert_eq!(a.partition, b.partition);
        assert_eq!(a.partition, partition_for("user-7", 4));
        assert_eq!(b.offset, a.offset + 1);
    }

    #[tokio::test]
    async fn produce_to_unknown_topic_fails() {
        let broker = Broker::in_memory();
        let err = broker.produce("missing", "k", b"v").await.unwrap_err();
        assert!(matches!(err, LogError::UnknownTopic(t) if t == "missing"));
    }

    #[test]
    fn create_topic_is_idempotent_but_rejects_mismatch() {
        let broker = broker_with_topic(2);
        broker.create_topic("clicks", 2).expect("same count is fine");
        let err = broker.create_topic("clicks", 3).unwrap_err();
        assert!(matches!(
            err,
            LogError::PartitionCountMismatch {
                existing: 2,
                requested: 3,
                ..
            }
        ));
        assert_eq!(broker.topics(), vec!["clicks".to_string()]);
    }

    #[tokio::test]
    async fn reader_waits_for_new_records() {
        let broker = broker_with_topic(1);
        let mut reader = broker.reader("clicks", 0, 0).expect("reader");
        assert!(reader.try_next().is_none());

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("clicks", "user-0", b"late").await.expect("produce");
        });

        let record = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .expect("record arrives")
            .expect("read ok");
        assert_eq!(record.value, b"late");
        assert_eq!(reader.position(), 1);
    }

    #[tokio::test]
    async fn reader_from_offset_skips_earlier_records() {
        let broker = broker_with_topic(1);
        for v in [b"a", b"b", b"c"] {
            broker.produce("clicks", "k", v).await.expect("produce");
        }
        let mut reader = broker.reader("clicks", 0, 2).expect("reader");
        assert_eq!(reader.try_next().expect("record").value, b"c");
        assert!(reader.try_next().is_none());
        assert_eq!(reader.high_watermark(), 3);
    }

    #[tokio::test]
    async fn produce_to_and_commit_are_fenced_after_release() {
        let broker = broker_with_topic(1);
        let membership = broker.join_group("g", "clicks").expect("join");
        let lease = membership.acquire(0).await.expect("acquire");
        let tp = TopicPartition::new("clicks", 0);

        broker
            .produce_to("clicks", 0, "k", b"v", &BTreeMap::new(), &lease)
            .await
            .expect("current lease may write");
        broker.commit(&tp, 0, &lease).await.expect("commit");
        assert_eq!(broker.committed("g", &tp), Some(0));

        membership.release(&lease);

        let err = broker
            .produce_to("clicks", 0, "k", b"v", &BTreeMap::new(), &lease)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Fenced { .. }));
        let err = broker.commit(&tp, 1, &lease).await.unwrap_err();
        assert!(matches!(err, LogError::Fenced { .. }));
        assert_eq!(broker.committed("g", &tp), Some(0));
    }

    #[tokio::test]
    async fn lease_for_other_partition_is_fenced() {
        let broker = broker_with_topic(2);
        let membership = broker.join_group("g", "clicks").expect("join");
        let lease = membership.acquire(0).await.expect("acquire");
        let err = broker
            .produce_to("clicks", 1, "k", b"v", &BTreeMap::new(), &lease)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Fenced { .. }));
    }

    #[tokio::test]
    async fn file_backed_broker_survives_reopen() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let tp = TopicPartition::new("clicks", 0);
        {
            let broker = Broker::open(tmp.path()).expect("open");
            broker.create_topic("clicks", 1).expect("create");
            broker.produce("clicks", "user-0", b"a").await.expect("produce");
            broker.produce("clicks", "user-0", b"b").await.expect("produce");
            let membership = broker.join_group("g", "clicks").expect("join");
            let lease = membership.acquire(0).await.expect("acquire");
            broker.commit(&tp, 1, &lease).await.expect("commit");
        }

        let broker = Broker::open(tmp.path()).expect("reopen");
        assert_eq!(broker.partitions("clicks").expect("partitions"), 1);
        assert_eq!(broker.high_watermark("clicks", 0).expect("hw"), 2);
        assert_eq!(broker.committed("g", &tp), Some(1));

        let pos = broker.produce("clicks", "user-0", b"c").await.expect("produce");
        assert_eq!(pos.offset, 2, "offsets continue after reopen");
        let mut reader = broker.reader("clicks", 0, 0).expect("reader");
        let values: Vec<Vec<u8>> = std::iter::from_fn(|| reader.try_next())
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn commit_io_failure_is_returned_once_retries_are_spent() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let broker = Broker::open(tmp.path())
            .expect("open")
            .with_retry_policy(RetryPolicy::none());
        broker.create_topic("clicks", 1).expect("create");
        // A plain file where the offsets directory belongs.
        fs::write(tmp.path().join("offsets"), b"").expect("block offsets dir");

        let membership = broker.join_group("g", "clicks").expect("join");
        let lease = membership.acquire(0).await.expect("acquire");
        let tp = TopicPartition::new("clicks", 0);
        let err = broker.commit(&tp, 0, &lease).await.unwrap_err();
        assert!(matches!(err, LogError::Io(_)));
        assert_eq!(broker.committed("g", &tp), None, "failed commit is not visible");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_on_one_group_all_persist() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let broker = Broker::open(tmp.path())
            .expect("open")
            .with_retry_policy(RetryPolicy::none());
        broker.create_topic("clicks", 4).expect("create");
        let membership = broker.join_group("g", "clicks").expect("join");

        let mut tasks = tokio::task::JoinSet::new();
        for partition in 0..4 {
            let lease = membership.acquire(partition).await.expect("acquire");
            let broker = broker.clone();
            tasks.spawn(async move {
                let tp = TopicPartition::new("clicks", partition);
                for offset in 0..200 {
                    broker.commit(&tp, offset, &lease).await?;
                }
                Ok::<_, LogError>(())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task").expect("every commit succeeds");
        }

        let reopened = Broker::open(tmp.path()).expect("reopen");
        for partition in 0..4 {
            let tp = TopicPartition::new("clicks", partition);
            assert_eq!(broker.committed("g", &tp), Some(199));
            assert_eq!(reopened.committed("g", &tp), Some(199), "{tp} on disk");
        }
    }

    #[tokio::test]
    async fn failed_append_is_rolled_back_before_retry() {
        let tmp = tempfile::tempdir().expect("temp dir");
        {
            let broker = Broker::open(tmp.path()).expect("open");
            broker.create_topic("clicks", 1).expect("create");
            broker.produce("clicks", "k", b"a").await.expect("produce");
        }
        let segment = DataLayout::new(tmp.path()).segment_path("clicks", 0);

        // A full line lands, then the sync fails.
        let mut file = OpenOptions::new().append(true).open(&segment).expect("open segment");
        let start = file.metadata().expect("metadata").len();
        file.write_all(b"{\"partition\":0,\"offset\":1,\"key\":\"k\",\"value\":[98],\"timestamp_ms\":0}\n")
            .expect("write line");
        let err = rollback_on_error(&file, start, Err(io::Error::other("sync failed"))).unwrap_err();
        assert_eq!(err.to_string(), "sync failed");
        assert_eq!(file.metadata().expect("metadata").len(), start);
        drop(file);

        let broker = Broker::open(tmp.path()).expect("segment still opens");
        assert_eq!(broker.high_watermark("clicks", 0).expect("hw"), 1);
        let pos = broker.produce("clicks", "k", b"b").await.expect("retry lands once");
        assert_eq!(pos.offset, 1);
        let broker = Broker::open(tmp.path()).expect("reopen after retry");
        assert_eq!(broker.high_watermark("clicks", 0).expect("hw"), 2);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_open() {
        let tmp = tempfile::tempdir().expect("temp dir");
        {
            let broker = Broker::open(tmp.path()).expect("open");
            broker.create_topic("clicks", 1).expect("create");
            broker.produce("clicks", "k", b"ok").await.expect("produce");
        }
        let segment = DataLayout::new(tmp.path()).segment_path("clicks", 0);
        let mut file = OpenOptions::new().append(true).open(&segment).expect("open segment");
        file.write_all(b"{\"partition\":0,\"offs").expect("write torn tail");
        drop(file);

        let broker = Broker::open(tmp.path()).expect("reopen");
        assert_eq!(broker.high_watermark("clicks", 0).expect("hw"), 1);
        broker.produce("clicks", "k", b"next").await.expect("append after repair");

        let broker = Broker::open(tmp.path()).expect("second reopen");
        assert_eq!(broker.high_watermark("clicks", 0).expect("hw"), 2);
    }

    #[tokio::test]
    async fn corruption_before_the_tail_is_an_error() {
        let tmp = tempfile::tempdir().expect("temp dir");
        {
            let broker = Broker::open(tmp.path()).expect("open");
            broker.create_topic("clicks", 1).expect("create");
        }
        let segment = DataLayout::new(tmp.path()).segment_path("clicks", 0);
        fs::write(&segment, "garbage\n{\"also\":\"garbage\"}\n").expect("write");

        let err = Broker::open(tmp.path()).unwrap_err();
        assert!(matches!(err, LogError::CorruptSegment { .. }));
    }
}
