//! Stateful processor: folds an input stream into per-key aggregates and
//! republishes every mutation to a changelog.
//!
//! Each owned partition runs as an independent task through
//!
//! ```text
//! Unassigned -> Recovering -> Running -> Revoked -> Unassigned
//!                                     \-> Failed
//! ```
//!
//! For every input record the task reads the key's current aggregate,
//! applies the event, writes the result to the local store, appends it to
//! the changelog (stamped with the input offset), and only then commits
//! the input offset. A supervisor task follows the group assignment,
//! starting and stopping partition tasks as partitions are gained and
//! revoked.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::aggregate::Aggregate;
use crate::broker::Broker;
use crate::codec::Codec;
use crate::error::{LogError, ProcessError, StoreError};
use crate::group::{Assignment, Lease, Membership};
use crate::live::{LiveConfig, RunHandle, stopped};
use crate::quarantine::{PoisonPolicy, Quarantine};
use crate::record::{Record, SOURCE_OFFSET_HEADER, TopicPartition};
use crate::store::{FileStores, MemoryStores, StateStore, StoreFactory, Table};

/// Records replayed into a store per `restore` call during recovery.
const RESTORE_BATCH: usize = 1024;

/// Lifecycle state of one partition in a [`Processor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionState {
    /// Not owned (or waiting for the previous owner to hand it over).
    Unassigned,
    /// Replaying the changelog into the local store.
    Recovering,
    /// Consuming input.
    Running,
    /// Ownership lost; local state discarded.
    Revoked,
    /// The local store failed or a write was fenced; the processor is
    /// shutting down.
    Failed,
}

/// Changelog topic name for a processor group.
pub fn changelog_topic(group: &str) -> String {
    format!("{group}-table")
}

/// Owner name under which a group's shards and dead letters are kept.
/// Views use the `view-` prefix, so the two never share files.
pub(crate) fn processor_owner(group: &str) -> String {
    format!("processor-{group}")
}

/// Builder for a [`Processor`].
pub struct ProcessorBuilder<A: Aggregate> {
    broker: Broker,
    group: Option<String>,
    input: Option<(String, Arc<dyn Codec<A::Event>>)>,
    persist: Option<Arc<dyn Codec<A>>>,
    stores: Option<Arc<dyn StoreFactory>>,
    live_config: LiveConfig,
    poison_policy: PoisonPolicy,
    quarantine: Option<Quarantine>,
}

impl<A: Aggregate> ProcessorBuilder<A> {
    /// Consumer group name. Also names the changelog topic
    /// (`"{group}-table"`).
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Input topic and the codec for its payloads.
    pub fn input(mut self, topic: impl Into<String>, codec: impl Codec<A::Event>) -> Self {
        let codec: Arc<dyn Codec<A::Event>> = Arc::new(codec);
        self.input = Some((topic.into(), codec));
        self
    }

    /// Codec for aggregates in the store and on the changelog.
    pub fn persist(mut self, codec: impl Codec<A>) -> Self {
        self.persist = Some(Arc::new(codec));
        self
    }

    /// Store factory. Defaults to file-backed shards when the broker has a
    /// data directory, in-memory shards otherwise.
    pub fn stores(mut self, factory: impl StoreFactory) -> Self {
        self.stores = Some(Arc::new(factory));
        self
    }

    /// Checkpoint tuning.
    pub fn live_config(mut self, config: LiveConfig) -> Self {
        self.live_config = config;
        self
    }

    /// What to do with input records that do not decode.
    pub fn poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.poison_policy = policy;
        self
    }

    /// Where skipped records go. Defaults to
    /// `<data_dir>/dead_letters/processor-<group>.jsonl` for file-backed
    /// brokers.
    pub fn quarantine(mut self, quarantine: Quarantine) -> Self {
        self.quarantine = Some(quarantine);
        self
    }

    /// Validate settings and create the changelog topic.
    ///
    /// # Errors
    ///
    /// * [`ProcessError::Config`] -- group, input or persist codec missing.
    /// * [`ProcessError::Log`] -- the input topic does not exist, or the
    ///   changelog exists with a different partition count.
    pub fn build(self) -> Result<Processor<A>, ProcessError> {
        let group = self
            .group
            .filter(|g| !g.is_empty())
            .ok_or_else(|| ProcessError::Config("group name is required".into()))?;
        let (input_topic, event_codec) = self
            .input
            .ok_or_else(|| ProcessError::Config("input topic is required".into()))?;
        let table_codec = self
            .persist
            .ok_or_else(|| ProcessError::Config("persist codec is required".into()))?;

        let changelog = changelog_topic(&group);
        if changelog == input_topic {
            return Err(ProcessError::Config(format!(
                "input topic {input_topic:?} collides with the changelog topic"
            )));
        }
        let partitions = self.broker.partitions(&input_topic)?;
        self.broker.create_topic(&changelog, partitions)?;

        let stores: Arc<dyn StoreFactory> = match (self.stores, self.broker.layout()) {
            (Some(stores), _) => stores,
            (None, Some(layout)) => Arc::new(FileStores::new(layout.clone())),
            (None, None) => Arc::new(MemoryStores),
        };
        let quarantine = match (self.quarantine, self.broker.layout()) {
            (Some(quarantine), _) => quarantine,
            (None, Some(layout)) => {
                Quarantine::to_file(layout.dead_letter_path(&processor_owner(&group)))
            }
            (None, None) => Quarantine::counting(),
        };

        Ok(Processor {
            broker: self.broker,
            group,
            input_topic,
            changelog_topic: changelog,
            partitions,
            event_codec,
            table_codec,
            stores,
            live_config: self.live_config,
            poison_policy: self.poison_policy,
            quarantine: Arc::new(quarantine),
        })
    }
}

/// A configured, not yet running, stateful processor.
pub struct Processor<A: Aggregate> {
    broker: Broker,
    group: String,
    input_topic: String,
    changelog_topic: String,
    partitions: u32,
    event_codec: Arc<dyn Codec<A::Event>>,
    table_codec: Arc<dyn Codec<A>>,
    stores: Arc<dyn StoreFactory>,
    live_config: LiveConfig,
    poison_policy: PoisonPolicy,
    quarantine: Arc<Quarantine>,
}

impl<A: Aggregate> std::fmt::Debug for Processor<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("group", &self.group)
            .field("input_topic", &self.input_topic)
            .field("changelog_topic", &self.changelog_topic)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl<A: Aggregate> Processor<A> {
    /// Start building a processor on `broker`.
    pub fn builder(broker: Broker) -> ProcessorBuilder<A> {
        ProcessorBuilder {
            broker,
            group: None,
            input: None,
            persist: None,
            stores: None,
            live_config: LiveConfig::default(),
            poison_policy: PoisonPolicy::default(),
            quarantine: None,
        }
    }

    /// Consumer group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Changelog topic name.
    pub fn changelog_topic(&self) -> &str {
        &self.changelog_topic
    }

    /// Join the group and start processing in the background.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Log`] if the group cannot be joined.
    pub fn start(self) -> Result<ProcessorHandle, ProcessError> {
        let membership = self.broker.join_group(&self.group, &self.input_topic)?;
        let member = membership.member_id().to_string();
        tracing::info!(
            group = %self.group,
            member = %member,
            input = %self.input_topic,
            changelog = %self.changelog_topic,
            partitions = self.partitions,
            "processor starting"
        );

        let initial: BTreeMap<u32, PartitionState> = (0..self.partitions)
            .map(|p| (p, PartitionState::Unassigned))
            .collect();
        let (states_tx, states_rx) = watch::channel(initial);
        let quarantine = Arc::clone(&self.quarantine);
        let group = self.group.clone();
        let changelog = self.changelog_topic.clone();

        let shared = Arc::new(Shared {
            broker: self.broker,
            group: self.group,
            input_topic: self.input_topic,
            changelog_topic: self.changelog_topic,
            event_codec: self.event_codec,
            table_codec: self.table_codec,
            stores: self.stores,
            live_config: self.live_config,
            poison_policy: self.poison_policy,
            quarantine: self.quarantine,
            states: states_tx,
        });

        let run = RunHandle::spawn(move |shutdown_rx| {
            supervise(shared, Arc::new(membership), shutdown_rx)
        });

        Ok(ProcessorHandle {
            run,
            states: states_rx,
            group,
            member,
            changelog_topic: changelog,
            quarantine,
        })
    }
}

/// Handle to a running [`Processor`].
///
/// `Clone` is cheap. Dropping every handle does not stop the processor;
/// call [`shutdown`](ProcessorHandle::shutdown).
#[derive(Clone)]
pub struct ProcessorHandle {
    run: RunHandle<ProcessError>,
    states: watch::Receiver<BTreeMap<u32, PartitionState>>,
    group: String,
    member: String,
    changelog_topic: String,
    quarantine: Arc<Quarantine>,
}

impl std::fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("group", &self.group)
            .field("member", &self.member)
            .field("states", &*self.states.borrow())
            .finish()
    }
}

impl ProcessorHandle {
    /// Consumer group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// This instance's member id within the group.
    pub fn member_id(&self) -> &str {
        &self.member
    }

    /// Changelog topic name.
    pub fn changelog_topic(&self) -> &str {
        &self.changelog_topic
    }

    /// Current state of every partition.
    pub fn states(&self) -> BTreeMap<u32, PartitionState> {
        self.states.borrow().clone()
    }

    /// Partitions currently in [`PartitionState::Running`].
    pub fn running_partitions(&self) -> BTreeSet<u32> {
        self.states
            .borrow()
            .iter()
            .filter(|(_, s)| **s == PartitionState::Running)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Number of input records skipped as undecodable.
    pub fn skipped_records(&self) -> u64 {
        self.quarantine.skipped()
    }

    /// Wait until `condition` holds for the partition states.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::TaskGone`] if the processor stops first.
    pub async fn wait_until(
        &self,
        mut condition: impl FnMut(&BTreeMap<u32, PartitionState>) -> bool,
    ) -> Result<(), ProcessError> {
        let mut rx = self.states.clone();
        rx.wait_for(|states| condition(states))
            .await
            .map(|_| ())
            .map_err(|_| ProcessError::TaskGone("processor stopped".into()))
    }

    /// Wait until `partition` reaches `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::TaskGone`] if the processor stops first.
    pub async fn wait_for_state(
        &self,
        partition: u32,
        state: PartitionState,
    ) -> Result<(), ProcessError> {
        self.wait_until(|states| states.get(&partition) == Some(&state))
            .await
    }

    /// Stop all partitions (flushing their stores), leave the group and
    /// wait for the processor to exit.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the processor, if it had already
    /// failed.
    pub async fn shutdown(&self) -> Result<(), ProcessError> {
        self.run.shutdown().await
    }

    /// Returns `true` once the processor has exited.
    pub async fn is_finished(&self) -> bool {
        self.run.is_finished().await
    }

    /// Wait for the processor to exit on its own.
    ///
    /// # Errors
    ///
    /// Returns the fatal error, for example a store failure.
    pub async fn join(&self) -> Result<(), ProcessError> {
        self.run.join().await
    }
}

struct Shared<A: Aggregate> {
    broker: Broker,
    group: String,
    input_topic: String,
    changelog_topic: String,
    event_codec: Arc<dyn Codec<A::Event>>,
    table_codec: Arc<dyn Codec<A>>,
    stores: Arc<dyn StoreFactory>,
    live_config: LiveConfig,
    poison_policy: PoisonPolicy,
    quarantine: Arc<Quarantine>,
    states: watch::Sender<BTreeMap<u32, PartitionState>>,
}

impl<A: Aggregate> Shared<A> {
    fn set_state(&self, partition: u32, state: PartitionState) {
        self.states.send_modify(|states| {
            states.insert(partition, state);
        });
    }
}

type PartitionResult = (u32, Result<(), ProcessError>);

struct Supervisor<A: Aggregate> {
    shared: Arc<Shared<A>>,
    membership: Arc<Membership>,
    tasks: JoinSet<PartitionResult>,
    stops: HashMap<u32, watch::Sender<bool>>,
}

impl<A: Aggregate> Supervisor<A> {
    fn reconcile(&mut self, assignment: &Assignment) {
        for (&partition, stop) in &self.stops {
            if !assignment.partitions.contains(&partition) {
                tracing::info!(group = %self.shared.group, partition, "partition revoked");
                let _ = stop.send(true);
            }
        }
        for &partition in &assignment.partitions {
            if !self.stops.contains_key(&partition) {
                self.spawn(partition);
            }
        }
    }

    fn spawn(&mut self, partition: u32) {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stops.insert(partition, stop_tx);
        let shared = Arc::clone(&self.shared);
        let membership = Arc::clone(&self.membership);
        let span = tracing::info_span!("partition", group = %shared.group, partition);
        self.tasks.spawn(
            async move {
                let result = run_partition(&shared, &membership, partition, stop_rx).await;
                (partition, result)
            }
            .instrument(span),
        );
    }

    async fn drain(&mut self) {
        for stop in self.stops.values() {
            let _ = stop.send(true);
        }
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((partition, Ok(()))) => {
                    self.shared.set_state(partition, PartitionState::Unassigned);
                }
                Ok((partition, Err(e))) => {
                    tracing::error!(partition, error = %e, "partition failed during shutdown");
                    self.shared.set_state(partition, PartitionState::Failed);
                }
                Err(e) => tracing::error!(error = %e, "partition task panicked"),
            }
        }
        self.stops.clear();
    }
}

async fn supervise<A: Aggregate>(
    shared: Arc<Shared<A>>,
    membership: Arc<Membership>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ProcessError> {
    let mut assignment_rx = membership.watch_assignment();
    let mut sup = Supervisor {
        shared,
        membership,
        tasks: JoinSet::new(),
        stops: HashMap::new(),
    };
    let initial = assignment_rx.borrow_and_update().clone();
    tracing::info!(
        group = %sup.shared.group,
        generation = initial.generation,
        partitions = ?initial.partitions,
        "initial assignment"
    );
    sup.reconcile(&initial);

    let outcome = loop {
        tokio::select! {
            _ = stopped(&mut shutdown_rx) => break Ok(()),
            changed = assignment_rx.changed() => {
                if changed.is_err() {
                    break Err(ProcessError::Log(LogError::NotMember(
                        sup.membership.member_id().to_string(),
                    )));
                }
                let assignment = assignment_rx.borrow_and_update().clone();
                tracing::info!(
                    group = %sup.shared.group,
                    generation = assignment.generation,
                    partitions = ?assignment.partitions,
                    "assignment changed"
                );
                sup.reconcile(&assignment);
            }
            Some(joined) = sup.tasks.join_next() => match joined {
                Ok((partition, Ok(()))) => {
                    sup.stops.remove(&partition);
                    sup.shared.set_state(partition, PartitionState::Unassigned);
                    if assignment_rx.borrow().partitions.contains(&partition) {
                        sup.spawn(partition);
                    }
                }
                Ok((partition, Err(e))) => {
                    sup.stops.remove(&partition);
                    sup.shared.set_state(partition, PartitionState::Failed);
                    tracing::error!(partition, error = %e, "partition failed, stopping processor");
                    break Err(e);
                }
                Err(e) => break Err(e.into()),
            },
        }
    };

    sup.drain().await;
    tracing::info!(
        group = %sup.shared.group,
        member = %sup.membership.member_id(),
        skipped = sup.shared.quarantine.skipped(),
        "processor stopped"
    );
    outcome
}

async fn run_partition<A: Aggregate>(
    shared: &Shared<A>,
    membership: &Membership,
    partition: u32,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), ProcessError> {
    let lease = tokio::select! {
        _ = stopped(&mut stop_rx) => return Ok(()),
        acquired = membership.acquire(partition) => match acquired {
            Ok(lease) => lease,
            Err(e) if e.is_ownership_loss() => {
                tracing::debug!(error = %e, "partition moved before it was acquired");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        },
    };
    tracing::debug!(epoch = lease.epoch, "lease acquired");
    shared.set_state(partition, PartitionState::Recovering);

    let exit = match OwnedPartition::open(shared, lease.clone()) {
        Ok(owned) => match owned.restore() {
            Ok(resume) => {
                shared.set_state(partition, PartitionState::Running);
                owned.run(resume, &mut stop_rx).await
            }
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    if exit.is_ok() {
        shared.set_state(partition, PartitionState::Revoked);
    }
    membership.release(&lease);
    exit
}

/// A partition this instance holds a lease on, with its store shard.
struct OwnedPartition<'a, A: Aggregate> {
    shared: &'a Shared<A>,
    lease: Lease,
    input: TopicPartition,
    changelog: TopicPartition,
    table: Table<A>,
}

impl<'a, A: Aggregate> OwnedPartition<'a, A> {
    fn open(shared: &'a Shared<A>, lease: Lease) -> Result<Self, ProcessError> {
        let partition = lease.partition;
        let input = TopicPartition::new(&shared.input_topic, partition);
        let changelog = TopicPartition::new(&shared.changelog_topic, partition);
        let store = shared
            .stores
            .open(&processor_owner(&shared.group), &changelog)
            .map_err(|source| ProcessError::Storage {
                partition: changelog.clone(),
                source,
            })?;
        Ok(Self {
            shared,
            lease,
            input,
            changelog,
            table: Table::new(store, Arc::clone(&shared.table_codec)),
        })
    }

    fn store(&self) -> &Arc<dyn StateStore> {
        self.table.store()
    }

    fn storage_error(&self, source: StoreError) -> ProcessError {
        ProcessError::Storage {
            partition: self.changelog.clone(),
            source,
        }
    }

    fn flush(&self) -> Result<(), ProcessError> {
        self.store().flush().map_err(|e| self.storage_error(e))
    }

    /// Replay the changelog into the store and return the input offset to
    /// resume from.
    fn restore(&self) -> Result<u64, ProcessError> {
        let broker = &self.shared.broker;
        let partition = self.changelog.partition;
        let high_watermark = broker.high_watermark(&self.changelog.topic, partition)?;

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
            self.store().reset().map_err(|e| self.storage_error(e))?;
        }

        let from = self.store().checkpoint().next_changelog_offset();
        let mut reader = broker.reader(&self.changelog.topic, partition, from)?;
        let mut batch: Vec<Record> = Vec::with_capacity(RESTORE_BATCH);
        let mut replayed = 0usize;
        while reader.position() < high_watermark {
            let Some(record) = reader.try_next() else {
                break;
            };
            batch.push(record);
            if batch.len() == RESTORE_BATCH {
                self.store()
                    .restore(&batch)
                    .map_err(|e| self.storage_error(e))?;
                replayed += batch.len();
                batch.clear();
            }
        }
        self.store()
            .restore(&batch)
            .map_err(|e| self.storage_error(e))?;
        replayed += batch.len();

        // The changelog may be ahead of the committed offset when a crash
        // hit between emission and commit.
        let committed = broker.committed(&self.shared.group, &self.input);
        let restored = self.store().checkpoint().source_offset;
        let resume = committed.max(restored).map_or(0, |o| o + 1);
        tracing::info!(
            from,
            replayed,
            keys = self.store().len(),
            committed = ?committed,
            restored_source = ?restored,
            resume,
            "partition recovered"
        );
        Ok(resume)
    }

    async fn run(
        &self,
        resume: u64,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), ProcessError> {
        let shared = self.shared;
        let mut reader = shared
            .broker
            .reader(&self.input.topic, self.input.partition, resume)?;
        let mut checkpoint = tokio::time::interval(shared.live_config.checkpoint_interval);
        // The first tick completes immediately; consume it.
        checkpoint.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stopped(stop_rx) => {
                    self.flush()?;
                    return Ok(());
                }
                _ = checkpoint.tick() => self.flush()?,
                // A fenced write means another owner may be mutating this
                // partition; it fails the processor like a store error.
                next = reader.next() => self.process(next?).await?,
            }
        }
    }

    async fn process(&self, record: Record) -> Result<(), ProcessError> {
        let shared = self.shared;
        let event = match shared.event_codec.decode(&record.value) {
            Ok(event) => event,
            Err(source) => match shared.poison_policy {
                PoisonPolicy::Skip => {
                    shared.quarantine.admit(&self.input, &record, &source);
                    shared
                        .broker
                        .commit(&self.input, record.offset, &self.lease)
                        .await?;
                    return Ok(());
                }
                PoisonPolicy::Fail => {
                    return Err(ProcessError::Poison {
                        partition: self.input.clone(),
                        offset: record.offset,
                        source,
                    });
                }
            },
        };

        let current = self
            .table
            .get(&record.key)
            .map_err(|e| self.storage_error(e))?;
        let next = current.unwrap_or_default().apply(&event);
        let encoded = self
            .table
            .encode(&next)
            .map_err(|source| ProcessError::Encode {
                key: record.key.clone(),
                source,
            })?;
        self.store()
            .set(&record.key, encoded.clone())
            .map_err(|e| self.storage_error(e))?;

        let headers = BTreeMap::from([(
            SOURCE_OFFSET_HEADER.to_string(),
            record.offset.to_string(),
        )]);
        let position = shared
            .broker
            .produce_to(
                &self.changelog.topic,
                self.changelog.partition,
                &record.key,
                &encoded,
                &headers,
                &self.lease,
            )
            .await?;
        self.store()
            .advance(position.offset, Some(record.offset))
            .map_err(|e| self.storage_error(e))?;
        shared
            .broker
            .commit(&self.input, record.offset, &self.lease)
            .await?;

        tracing::debug!(
            key = %record.key,
            offset = record.offset,
            aggregate = %String::from_utf8_lossy(&encoded),
            payload = %String::from_utf8_lossy(&record.value),
            "processed event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterEvent};
    use crate::codec::JsonCodec;
    use crate::layout::DataLayout;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn broker(partitions: u32) -> Broker {
        let broker = Broker::in_memory();
        broker.create_topic("input", partitions).expect("create input");
        broker
    }

    fn builder(broker: &Broker) -> ProcessorBuilder<Counter> {
        Processor::<Counter>::builder(broker.clone())
            .group("counter")
            .input("input", JsonCodec::<CounterEvent>::new())
            .persist(JsonCodec::<Counter>::new())
            .live_config(LiveConfig {
                checkpoint_interval: Duration::from_millis(50),
                ..LiveConfig::default()
            })
    }

    async fn emit(broker: &Broker, key: &str, event: &CounterEvent) {
        let bytes = serde_json::to_vec(event).expect("serialize event");
        broker.produce("input", key, &bytes).await.expect("produce");
    }

    /// Read `n` changelog records from partition 0, waiting as needed.
    async fn read_changelog(broker: &Broker, n: usize) -> Vec<Record> {
        let mut reader = broker.reader("counter-table", 0, 0).expect("reader");
        let mut records = Vec::new();
        for _ in 0..n {
            let record = tokio::time::timeout(TIMEOUT, reader.next())
                .await
                .expect("changelog record in time")
                .expect("read");
            records.push(record);
        }
        records
    }

    fn value(record: &Record) -> u64 {
        serde_json::from_slice::<Counter>(&record.value)
            .expect("changelog value decodes")
            .value
    }

    #[test]
    fn build_requires_group_input_and_codec() {
        let broker = broker(1);
        let err = Processor::<Counter>::builder(broker.clone())
            .input("input", JsonCodec::<CounterEvent>::new())
            .persist(JsonCodec::<Counter>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ProcessError::Config(_)));

        let err = Processor::<Counter>::builder(broker.clone())
            .group("counter")
            .persist(JsonCodec::<Counter>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ProcessError::Config(_)));

        let err = Processor::<Counter>::builder(broker)
            .group("counter")
            .input("input", JsonCodec::<CounterEvent>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ProcessError::Config(_)));
    }

    #[test]
    fn build_rejects_unknown_input_topic() {
        let broker = Broker::in_memory();
        let err = builder(&broker).build().unwrap_err();
        assert!(matches!(err, ProcessError::Log(LogError::UnknownTopic(_))));
    }

    #[test]
    fn build_creates_copartitioned_changelog() {
        let broker = broker(3);
        let processor = builder(&broker).build().expect("build");
        assert_eq!(processor.changelog_topic(), "counter-table");
        assert_eq!(broker.partitions("counter-table").expect("changelog exists"), 3);
    }

    #[tokio::test]
    async fn folds_events_and_emits_changelog_in_order() {
        let broker = broker(1);
        let handle = builder(&broker).build().expect("build").start().expect("start");

        for _ in 0..3 {
            emit(&broker, "user-0", &CounterEvent::Incremented).await;
        }
        let records = read_changelog(&broker, 3).await;

        assert_eq!(records.iter().map(value).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            records.iter().map(|r| r.source_offset()).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2)]
        );
        assert!(records.iter().all(|r| r.key == "user-0"));

        tokio::time::timeout(TIMEOUT, async {
            while broker.committed("counter", &TopicPartition::new("input", 0)) != Some(2) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offset 2 committed");

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn keys_are_aggregated_independently() {
        let broker = broker(1);
        let handle = builder(&broker).build().expect("build").start().expect("start");

        emit(&broker, "a", &CounterEvent::Added { amount: 5 }).await;
        emit(&broker, "b", &CounterEvent::Incremented).await;
        emit(&broker, "a", &CounterEvent::Incremented).await;

        let records = read_changelog(&broker, 3).await;
        let last_a = records.iter().rev().find(|r| r.key == "a").expect("a emitted");
        let last_b = records.iter().rev().find(|r| r.key == "b").expect("b emitted");
        assert_eq!(value(last_a), 6);
        assert_eq!(value(last_b), 1);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn all_partitions_reach_running() {
        let broker = broker(4);
        let handle = builder(&broker).build().expect("build").start().expect("start");

        tokio::time::timeout(
            TIMEOUT,
            handle.wait_until(|s| s.values().all(|p| *p == PartitionState::Running)),
        )
        .await
        .expect("running in time")
        .expect("processor alive");
        assert_eq!(handle.running_partitions().len(), 4);

        handle.shutdown().await.expect("shutdown");
        assert!(
            handle
                .states()
                .values()
                .all(|s| *s == PartitionState::Unassigned)
        );
    }

    #[tokio::test]
    async fn poison_record_is_skipped_by_default() {
        let broker = broker(1);
        let handle = builder(&broker).build().expect("build").start().expect("start");

        broker
            .produce("input", "user-0", b"definitely not json")
            .await
            .expect("produce poison");
        emit(&broker, "user-0", &CounterEvent::Incremented).await;

        let records = read_changelog(&broker, 1).await;
        assert_eq!(value(&records[0]), 1);
        assert_eq!(records[0].source_offset(), Some(1));
        assert_eq!(handle.skipped_records(), 1);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn poison_record_stops_processor_under_fail_policy() {
        let broker = broker(1);
        let handle = builder(&broker)
            .poison_policy(PoisonPolicy::Fail)
            .build()
            .expect("build")
            .start()
            .expect("start");

        broker
            .produce("input", "user-0", b"definitely not json")
            .await
            .expect("produce poison");

        let err = tokio::time::timeout(TIMEOUT, handle.join())
            .await
            .expect("processor exits")
            .unwrap_err();
        assert!(matches!(err, ProcessError::Poison { offset: 0, .. }));
    }

    /// A shard that accepts reads but rejects every write.
    struct RejectingStore(MemoryStore);

    impl StateStore for RejectingStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.0.get(key)
        }
        fn set(&self, key: &str, _value: Vec<u8>) -> Result<(), StoreError> {
            Err(StoreError::WriteRejected {
                key: key.to_string(),
                reason: "disk full".into(),
            })
        }
        fn checkpoint(&self) -> crate::store::StoreCheckpoint {
            self.0.checkpoint()
        }
        fn advance(&self, changelog: u64, source: Option<u64>) -> Result<(), StoreError> {
            self.0.advance(changelog, source)
        }
        fn len(&self) -> usize {
            self.0.len()
        }
        fn flush(&self) -> Result<(), StoreError> {
            Ok(())
        }
        fn reset(&self) -> Result<(), StoreError> {
            self.0.reset()
        }
    }

    struct RejectingStores;

    impl StoreFactory for RejectingStores {
        fn open(
            &self,
            _owner: &str,
            _tp: &TopicPartition,
        ) -> Result<Arc<dyn StateStore>, StoreError> {
            Ok(Arc::new(RejectingStore(MemoryStore::new())))
        }
    }

    #[tokio::test]
    async fn store_failure_fails_partition_and_leaves_group() {
        let broker = broker(1);
        let handle = builder(&broker)
            .stores(RejectingStores)
            .build()
            .expect("build")
            .start()
            .expect("start");

        emit(&broker, "user-0", &CounterEvent::Incremented).await;

        let err = tokio::time::timeout(TIMEOUT, handle.join())
            .await
            .expect("processor exits")
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Storage {
                source: StoreError::WriteRejected { .. },
                ..
            }
        ));
        assert!(handle.is_finished().await);
        assert_eq!(handle.states().get(&0), Some(&PartitionState::Failed));
        assert_eq!(broker.high_watermark("counter-table", 0).expect("hw"), 0);

        let group = broker.coordinator().describe("counter");
        assert!(group.is_none_or(|g| g.members.is_empty()), "member left the group");
    }

    #[tokio::test]
    async fn restart_resumes_after_last_commit() {
        let broker = broker(1);
        let first = builder(&broker).build().expect("build").start().expect("start");
        emit(&broker, "user-0", &CounterEvent::Incremented).await;
        emit(&broker, "user-0", &CounterEvent::Incremented).await;
        read_changelog(&broker, 2).await;
        first.shutdown().await.expect("shutdown");

        emit(&broker, "user-0", &CounterEvent::Incremented).await;
        let second = builder(&broker).build().expect("build").start().expect("start");

        let records = read_changelog(&broker, 3).await;
        assert_eq!(records.iter().map(value).collect::<Vec<_>>(), vec![1, 2, 3]);
        second.shutdown().await.expect("shutdown");
        assert_eq!(broker.high_watermark("counter-table", 0).expect("hw"), 3);
    }

    #[tokio::test]
    async fn fenced_write_fails_processor() {
        let broker = broker(1);
        let handle = builder(&broker).build().expect("build").start().expect("start");
        emit(&broker, "user-0", &CounterEvent::Incremented).await;
        read_changelog(&broker, 1).await;

        broker.coordinator().expire_lease("counter", 0);
        emit(&broker, "user-0", &CounterEvent::Incremented).await;

        let err = tokio::time::timeout(TIMEOUT, handle.join())
            .await
            .expect("processor exits")
            .unwrap_err();
        assert!(
            matches!(&err, ProcessError::Log(e) if e.is_ownership_loss()),
            "unexpected error: {err}"
        );
        assert_eq!(handle.states().get(&0), Some(&PartitionState::Failed));
        assert_eq!(broker.high_watermark("counter-table", 0).expect("hw"), 1);
    }

    #[tokio::test]
    async fn snapshot_ahead_of_changelog_is_rebuilt() {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let stores = || FileStores::new(DataLayout::new(tmp.path()));

        let first = broker(1);
        let handle = builder(&first)
            .stores(stores())
            .build()
            .expect("build")
            .start()
            .expect("start");
        for _ in 0..3 {
            emit(&first, "user-0", &CounterEvent::Incremented).await;
        }
        read_changelog(&first, 3).await;
        handle.shutdown().await.expect("shutdown");
        assert!(
            DataLayout::new(tmp.path())
                .snapshot_path("processor-counter", "counter-table", 0)
                .exists()
        );

        // A fresh log whose changelog is shorter than the snapshot.
        let second = broker(1);
        emit(&second, "user-0", &CounterEvent::Incremented).await;
        let handle = builder(&second)
            .stores(stores())
            .build()
            .expect("build")
            .start()
            .expect("start");

        let records = read_changelog(&second, 1).await;
        assert_eq!(value(&records[0]), 1);
        assert_eq!(records[0].source_offset(), Some(0));
        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let broker = broker(1);
        let handle = builder(&broker).build().expect("build").start().expect("start");
        handle.shutdown().await.expect("first");
        handle.shutdown().await.expect("second");
    }
}
