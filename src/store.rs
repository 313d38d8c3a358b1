//! Per-partition key-value state stores.
//!
//! A store shard holds the latest codec-encoded value per key for one
//! partition, plus a [`StoreCheckpoint`] recording how far into the
//! changelog (and, transitively, the input stream) its contents reach.
//! The changelog is the source of truth: any shard can be rebuilt by
//! replaying it through [`StateStore::restore`].

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{CodecError, StoreError};
use crate::layout::{DataLayout, write_atomic};
use crate::record::{Record, TopicPartition};

/// How far a shard's contents reach into its changelog partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCheckpoint {
    /// Offset of the last changelog record reflected in the shard.
    pub changelog_offset: Option<u64>,
    /// Highest input offset named by a reflected changelog record's
    /// `source-offset` header.
    pub source_offset: Option<u64>,
}

impl StoreCheckpoint {
    /// First changelog offset not yet reflected in the shard.
    pub fn next_changelog_offset(&self) -> u64 {
        self.changelog_offset.map_or(0, |o| o + 1)
    }
}

/// A key-value shard for one partition.
///
/// Implementations use interior mutability: a single writer (the owner of
/// the partition) mutates the shard while readers call [`get`](Self::get)
/// concurrently. A `get` never observes a partially written value.
pub trait StateStore: Send + Sync {
    /// Current value for `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the value for `key`.
    ///
    /// A failure here is fatal to the caller's ownership of the partition.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// The shard's current checkpoint.
    fn checkpoint(&self) -> StoreCheckpoint;

    /// Move the checkpoint forward. Never moves it backwards.
    fn advance(&self, changelog_offset: u64, source_offset: Option<u64>)
    -> Result<(), StoreError>;

    /// Number of keys held.
    fn len(&self) -> usize;

    /// Returns `true` if no key is held.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the shard, if it has a durable form.
    fn flush(&self) -> Result<(), StoreError>;

    /// Drop all contents and the checkpoint.
    fn reset(&self) -> Result<(), StoreError>;

    /// Apply one changelog record, last-write-wins.
    ///
    /// Records at or below the checkpoint are skipped, so applying the
    /// same record twice leaves the shard unchanged. Returns whether the
    /// record was applied.
    fn apply(&self, record: &Record) -> Result<bool, StoreError> {
        if self
            .checkpoint()
            .changelog_offset
            .is_some_and(|applied| record.offset <= applied)
        {
            return Ok(false);
        }
        self.set(&record.key, record.value.clone())?;
        self.advance(record.offset, record.source_offset())?;
        Ok(true)
    }

    /// Apply a sequence of changelog records in order.
    fn restore(&self, records: &[Record]) -> Result<(), StoreError> {
        for record in records {
            self.apply(record)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ShardState {
    checkpoint: StoreCheckpoint,
    entries: HashMap<String, Vec<u8>>,
}

impl ShardState {
    fn advance(&mut self, changelog_offset: u64, source_offset: Option<u64>) {
        let cp = &mut self.checkpoint;
        cp.changelog_offset = Some(
            cp.changelog_offset
                .map_or(changelog_offset, |o| o.max(changelog_offset)),
        );
        if let Some(source) = source_offset {
            cp.source_offset = Some(cp.source_offset.map_or(source, |o| o.max(source)));
        }
    }
}

/// Volatile in-memory shard.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<ShardState>,
}

impl MemoryStore {
    /// Create an empty shard.
    pub fn new() -> Self {
        Self::default()
    }

    fn from_state(state: ShardState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    fn snapshot(&self) -> ShardState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn checkpoint(&self) -> StoreCheckpoint {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .checkpoint
    }

    fn advance(
        &self,
        changelog_offset: u64,
        source_offset: Option<u64>,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .advance(changelog_offset, source_offset);
        Ok(())
    }

    fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .len()
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ShardState::default();
        Ok(())
    }
}

/// On-disk snapshot format.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    checkpoint: StoreCheckpoint,
    entries: HashMap<String, Vec<u8>>,
}

/// In-memory shard with a JSON snapshot on disk.
///
/// The snapshot is only an accelerator: it is written atomically on
/// [`flush`](StateStore::flush) and a missing or corrupt snapshot simply
/// means a longer changelog replay.
pub struct FileStore {
    path: PathBuf,
    memory: MemoryStore,
    dirty: AtomicBool,
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("checkpoint", &self.memory.checkpoint())
            .finish()
    }
}

impl FileStore {
    /// Open the shard at `path`, loading its snapshot if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] for unexpected I/O failures. A snapshot
    /// that does not parse is logged and ignored.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match load_snapshot(&path)? {
            Some(snap) => {
                tracing::debug!(
                    path = %path.display(),
                    keys = snap.entries.len(),
                    checkpoint = ?snap.checkpoint,
                    "loaded store snapshot"
                );
                ShardState {
                    checkpoint: snap.checkpoint,
                    entries: snap.entries,
                }
            }
            None => ShardState::default(),
        };
        Ok(Self {
            path,
            memory: MemoryStore::from_state(state),
            dirty: AtomicBool::new(false),
        })
    }

    /// Snapshot file location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_snapshot(path: &Path) -> io::Result<Option<Snapshot>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice::<Snapshot>(&bytes) {
        Ok(snap) => Ok(Some(snap)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to deserialize store snapshot; rebuilding from changelog"
            );
            Ok(None)
        }
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.memory.get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.memory.set(key, value)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn checkpoint(&self) -> StoreCheckpoint {
        self.memory.checkpoint()
    }

    fn advance(
        &self,
        changelog_offset: u64,
        source_offset: Option<u64>,
    ) -> Result<(), StoreError> {
        self.memory.advance(changelog_offset, source_offset)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn len(&self) -> usize {
        self.memory.len()
    }

    fn flush(&self) -> Result<(), StoreError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let state = self.memory.snapshot();
        let snap = Snapshot {
            checkpoint: state.checkpoint,
            entries: state.entries,
        };
        let result = serde_json::to_vec(&snap)
            .map_err(io::Error::other)
            .and_then(|json| write_atomic(&self.path, &json));
        if let Err(e) = result {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.memory.reset()?;
        self.dirty.store(false, Ordering::Release);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Opens a shard for a `(topic, partition)` on behalf of `owner`.
///
/// `owner` distinguishes components that keep separate shards of the same
/// changelog partition (a processor group and a view, for example).
pub trait StoreFactory: Send + Sync + 'static {
    /// Open (or create) the shard.
    fn open(&self, owner: &str, tp: &TopicPartition) -> Result<Arc<dyn StateStore>, StoreError>;
}

/// Factory for [`MemoryStore`] shards. Every `open` returns a fresh shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStores;

impl StoreFactory for MemoryStores {
    fn open(&self, _owner: &str, _tp: &TopicPartition) -> Result<Arc<dyn StateStore>, StoreError> {
        Ok(Arc::new(MemoryStore::new()))
    }
}

/// Factory for [`FileStore`] shards under a [`DataLayout`].
#[derive(Debug, Clone)]
pub struct FileStores {
    layout: DataLayout,
}

impl FileStores {
    /// Create a factory storing snapshots under `layout`.
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }
}

impl StoreFactory for FileStores {
    fn open(&self, owner: &str, tp: &TopicPartition) -> Result<Arc<dyn StateStore>, StoreError> {
        let path = self.layout.snapshot_path(owner, &tp.topic, tp.partition);
        Ok(Arc::new(FileStore::open(path)?))
    }
}

/// Typed access to a shard through a [`Codec`].
pub struct Table<V> {
    store: Arc<dyn StateStore>,
    codec: Arc<dyn Codec<V>>,
}

impl<V> Clone for Table<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<V: 'static> Table<V> {
    /// Pair a shard with a value codec.
    pub fn new(store: Arc<dyn StateStore>, codec: Arc<dyn Codec<V>>) -> Self {
        Self { store, codec }
    }

    /// The underlying shard.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Decoded value for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the stored bytes do not decode.
    pub fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        match self.store.get(key)? {
            Some(bytes) => self
                .codec
                .decode(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Encode a value with the table's codec.
    pub fn encode(&self, value: &V) -> Result<Vec<u8>, CodecError> {
        self.codec.encode(value)
    }

    /// Decode bytes with the table's codec.
    pub fn decode(&self, bytes: &[u8]) -> Result<V, CodecError> {
        self.codec.decode(bytes)
    }
}
