//! Read-only replica of a changelog table.
//!
//! A view replays every partition of a changelog into local store shards
//! and keeps applying new records as they arrive. It takes no part in
//! group coordination: every view instance holds the full table.
//!
//! Per partition:
//!
//! ```text
//! Initializing -> CatchingUp -> Live
//! ```
//!
//! A partition is `Live` once it has applied every record that existed
//! when it started catching up. Whether reads are answered before that is
//! decided by the [`ReadPolicy`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::broker::{Broker, PartitionReader};
use crate::codec::Codec;
use crate::error::ViewError;
use crate::live::{LiveConfig, RunHandle, stopped};
use crate::quarantine::{PoisonPolicy, Quarantine};
use crate::record::{Record, TopicPartition, partition_for};
use crate::store::{FileStores, MemoryStores, StateStore, StoreFactory, Table};

/// Replication state of one view partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewState {
    /// Store shard being opened.
    Initializing,
    /// Replaying the changelog up to the high watermark seen at start.
    CatchingUp,
    /// Caught up; applying new records as they arrive.
    Live,
}

/// Whether reads are served before a partition is [`ViewState::Live`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Reads on a partition that is not yet live fail with
    /// [`ViewError::NotReady`].
    #[default]
    RequireLive,
    /// Reads are served from whatever has been applied so far.
    AllowStale,
}

/// Builder for a [`View`].
pub struct ViewBuilder<V> {
    broker: Broker,
    table: Option<(String, Arc<dyn Codec<V>>)>,
    stores: Option<Arc<dyn StoreFactory>>,
    owner: String,
    read_policy: ReadPolicy,
    live_config: LiveConfig,
    poison_policy: PoisonPolicy,
    quarantine: Option<Quarantine>,
}

impl<V: Send + Sync + 'static> ViewBuilder<V> {
    /// Changelog topic to replicate and the codec for its values.
    pub fn table(mut self, topic: impl Into<String>, codec: impl Codec<V>) -> Self {
        let codec: Arc<dyn Codec<V>> = Arc::new(codec);
        self.table = Some((topic.into(), codec));
        self
    }

    /// Store factory. Defaults to file-backed shards when the broker has a
    /// data directory, in-memory shards otherwise.
    pub fn stores(mut self, factory: impl StoreFactory) -> Self {
        self.stores = Some(Arc::new(factory));
        self
    }

    /// Name under which shards (and dead letters) are kept, prefixed with
    /// `view-` on disk. Default `"view"`.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Read policy during catch-up.
    pub fn read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    /// Checkpoint tuning.
    pub fn live_config(mut self, config: LiveConfig) -> Self {
        self.live_config = config;
        self
    }

    /// What to do with changelog records that do not decode.
    pub fn poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.poison_policy = policy;
        self
    }

    /// Where skipped records go.
    pub fn quarantine(mut self, quarantine: Quarantine) -> Self {
        self.quarantine = Some(quarantine);
        self
    }

    /// Open every shard and start replicating in the background.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`ViewError::Config`] -- no table configured.
    /// * [`ViewError::Log`] -- the changelog topic does not exist.
    /// * [`ViewError::Storage`] -- a shard could not be opened.
    pub fn open(self) -> Result<View<V>, ViewError> {
        let (topic, codec) = self
            .table
            .ok_or_else(|| ViewError::Config("table topic is required".into()))?;
        if self.owner.is_empty() {
            return Err(ViewError::Config("owner must not be empty".into()));
        }
        let partitions = self.broker.partitions(&topic)?;
        let owner = view_owner(&self.owner);

        let stores: Arc<dyn StoreFactory> = match (self.stores, self.broker.layout()) {
            (Some(stores), _) => stores,
            (None, Some(layout)) => Arc::new(FileStores::new(layout.clone())),
            (None, None) => Arc::new(MemoryStores),
        };
        let quarantine = Arc::new(match (self.quarantine, self.broker.layout()) {
            (Some(quarantine), _) => quarantine,
            (None, Some(layout)) => Quarantine::to_file(layout.dead_letter_path(&owner)),
            (None, None) => Quarantine::counting(),
        });

        let (states_tx, states_rx) =
            watch::channel(vec![ViewState::Initializing; partitions as usize]);
        let mut shards = Vec::with_capacity(partitions as usize);
        for p in 0..partitions {
            let tp = TopicPartition::new(&topic, p);
            let store = stores.open(&owner, &tp)?;
            shards.push(Table::new(store, Arc::clone(&codec)));
        }

        let replicas: Vec<Replica<V>> = shards
            .iter()
            .enumerate()
            .map(|(p, table)| Replica {
                broker: self.broker.clone(),
                tp: TopicPartition::new(&topic, p as u32),
                table: table.clone(),
                live_config: self.live_config.clone(),
                poison_policy: self.poison_policy,
                quarantine: Arc::clone(&quarantine),
                states: states_tx.clone(),
            })
            .collect();
        drop(states_tx);

        tracing::info!(
            topic = %topic,
            owner = %self.owner,
            partitions,
            read_policy = ?self.read_policy,
            "view opening"
        );
        let run = RunHandle::spawn(move |shutdown_rx| replicate(replicas, shutdown_rx));

        Ok(View {
            inner: Arc::new(ViewInner {
                topic,
                shards,
                read_policy: self.read_policy,
                quarantine,
                handle: ViewHandle {
                    run,
                    states: states_rx,
                },
            }),
        })
    }
}

/// On-disk owner for a view's shards. Processors use the `processor-`
/// prefix, so the two never share files.
fn view_owner(owner: &str) -> String {
    format!("view-{owner}")
}

struct ViewInner<V> {
    topic: String,
    shards: Vec<Table<V>>,
    read_policy: ReadPolicy,
    quarantine: Arc<Quarantine>,
    handle: ViewHandle,
}

/// A local, continuously updated replica of a changelog table.
///
/// `Clone` is cheap: all state is shared behind an `Arc`.
pub struct View<V> {
    inner: Arc<ViewInner<V>>,
}

impl<V> Clone for View<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for View<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("topic", &self.inner.topic)
            .field("read_policy", &self.inner.read_policy)
            .field("states", &self.inner.handle.states())
            .finish()
    }
}

impl<V: Send + Sync + 'static> View<V> {
    /// Start building a view on `broker`.
    pub fn builder(broker: Broker) -> ViewBuilder<V> {
        ViewBuilder {
            broker,
            table: None,
            stores: None,
            owner: "view".to_string(),
            read_policy: ReadPolicy::default(),
            live_config: LiveConfig::default(),
            poison_policy: PoisonPolicy::default(),
            quarantine: None,
        }
    }
}

impl<V: 'static> View<V> {
    /// Replicated topic name.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Number of partitions replicated.
    pub fn partitions(&self) -> u32 {
        self.inner.shards.len() as u32
    }

    /// Look up the latest value for `key`.
    ///
    /// Never waits on replication: the result reflects the last changelog
    /// record applied for the key at call time.
    ///
    /// # Errors
    ///
    /// * [`ViewError::NotReady`] -- under [`ReadPolicy::RequireLive`], the
    ///   key's partition is still catching up.
    /// * [`ViewError::Storage`] -- the stored value does not decode.
    pub fn get(&self, key: &str) -> Result<Option<V>, ViewError> {
        let partition = partition_for(key, self.partitions());
        if self.inner.read_policy == ReadPolicy::RequireLive
            && self.inner.handle.state(partition) != Some(ViewState::Live)
        {
            return Err(ViewError::NotReady(partition));
        }
        Ok(self.inner.shards[partition as usize].get(key)?)
    }

    /// Number of changelog records skipped as undecodable.
    pub fn skipped_records(&self) -> u64 {
        self.inner.quarantine.skipped()
    }

    /// Control handle for the replication task.
    pub fn handle(&self) -> ViewHandle {
        self.inner.handle.clone()
    }
}

/// Control handle for a [`View`]'s replication.
#[derive(Clone)]
pub struct ViewHandle {
    run: RunHandle<ViewError>,
    states: watch::Receiver<Vec<ViewState>>,
}

impl std::fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle")
            .field("states", &*self.states.borrow())
            .finish()
    }
}

impl ViewHandle {
    /// State of every partition, indexed by partition number.
    pub fn states(&self) -> Vec<ViewState> {
        self.states.borrow().clone()
    }

    fn state(&self, partition: u32) -> Option<ViewState> {
        self.states.borrow().get(partition as usize).copied()
    }

    /// Returns `true` once every partition is live.
    pub fn is_live(&self) -> bool {
        self.states.borrow().iter().all(|s| *s == ViewState::Live)
    }

    /// Wait until every partition is live.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::TaskGone`] if replication stops first.
    pub async fn wait_live(&self) -> Result<(), ViewError> {
        let mut rx = self.states.clone();
        rx.wait_for(|states| states.iter().all(|s| *s == ViewState::Live))
            .await
            .map(|_| ())
            .map_err(|_| ViewError::TaskGone("view replication stopped".into()))
    }

    /// Returns `true` once replication has stopped.
    pub async fn is_finished(&self) -> bool {
        self.run.is_finished().await
    }

    /// Stop replicating, flushing every shard.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped replication, if it had already failed.
    pub async fn shutdown(&self) -> Result<(), ViewError> {
        self.run.shutdown().await
    }

    /// Wait for replication to stop on its own.
    ///
    /// # Errors
    ///
    /// Returns the fatal error, for example a store failure.
    pub async fn join(&self) -> Result<(), ViewError> {
        self.run.join().await
    }
}

async fn replicate<V: Send + Sync + 'static>(
    replicas: Vec<Replica<V>>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ViewError> {
    let mut tasks = JoinSet::new();
    for replica in replicas {
        let span = tracing::info_span!("view", partition = %replica.tp);
        let stop_rx = shutdown_rx.clone();
        tasks.spawn(async move { replica.run(stop_rx).await }.instrument(span));
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined? {
            tracing::error!(error = %e, "view partition failed, stopping replication");
            tasks.abort_all();
            return Err(e);
        }
    }
    Ok(())
}

struct Replica<V> {
    broker: Broker,
    tp: TopicPartition,
    table: Table<V>,
    live_config: LiveConfig,
    poison_policy: PoisonPolicy,
    quarantine: Arc<Quarantine>,
    states: watch::Sender<Vec<ViewState>>,
}

impl<V: 'static> Replica<V> {
    fn store(&self) -> &Arc<dyn StateStore> {
        self.table.store()
    }

    fn set_state(&self, state: ViewState) {
        let index = self.tp.partition as usize;
        self.states.send_modify(|states| states[index] = state);
    }

    fn open_reader(&self) -> Result<PartitionReader, ViewError> {
        let from = self.store().checkpoint().next_changelog_offset();
        Ok(self.broker.reader(&self.tp.topic, self.tp.partition, from)?)
    }

    async fn run(self, mut stop_rx: watch::Receiver<bool>) -> Result<(), ViewError> {
        self.set_state(ViewState::CatchingUp);
        let high_watermark = self
            .broker
            .high_watermark(&self.tp.topic, self.tp.partition)?;
        let checkpoint = self.store().checkpoint();
        if checkpoint
            .changelog_offset
            .is_some_and(|o| o >= high_watermark)
        {
            tracing::warn!(
                snapshot_offset = ?checkpoint.changelog_offset,
                high_watermark,
                "snapshot is ahead of the changelog, rebuilding"
            );
            self.store().reset()?;
        }

        let mut reader = self.open_reader()?;
        let mut live = reader.position() >= high_watermark;
        if live {
            self.go_live(high_watermark);
        }

        let mut checkpoint = tokio::time::interval(self.live_config.checkpoint_interval);
        // The first tick completes immediately; consume it.
        checkpoint.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut stop_rx) => {
                    self.store().flush()?;
                    return Ok(());
                }
                _ = checkpoint.tick() => self.store().flush()?,
                next = reader.next() => {
                    self.apply(&next?)?;
                    if !live && reader.position() >= high_watermark {
                        live = true;
                        self.go_live(high_watermark);
                    }
                }
            }
        }
    }

    fn go_live(&self, high_watermark: u64) {
        self.set_state(ViewState::Live);
        tracing::info!(
            high_watermark,
            keys = self.store().len(),
            "view partition live"
        );
    }

    fn apply(&self, record: &Record) -> Result<(), ViewError> {
        match self.table.decode(&record.value) {
            Ok(_) => {
                self.store().apply(record)?;
                Ok(())
            }
            Err(source) => match self.poison_policy {
                PoisonPolicy::Skip => {
                    self.quarantine.admit(&self.tp, record, &source);
                    self.store()
                        .advance(record.offset, None)
                        .map_err(ViewError::from)
                }
                PoisonPolicy::Fail => Err(ViewError::Poison {
                    partition: self.tp.clone(),
                    offset: record.offset,
                    source,
                }),
            },
        }
    }
}
